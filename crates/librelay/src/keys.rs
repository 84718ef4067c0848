use crate::errors::RelayError;
use crate::hub::{PreKeyEntity, RegisterKeysRequest, SignalClient, SignedPreKeyEntity};
use crate::store::SignalStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use librelay_protocol::{PreKeyRecord, ProtocolStore, SignedPreKeyRecord};

pub const PREKEY_BATCH_SIZE: u32 = 100;

const STATE_MAX_PREKEY_ID: &str = "maxPreKeyId";
const STATE_SIGNED_KEY_ID: &str = "signedKeyId";

/// Mints a fresh batch of one-time prekeys plus a new signed prekey,
/// persists them, and returns the payload for key registration.
pub async fn generate_keys(store: &SignalStore) -> Result<RegisterKeysRequest, RelayError> {
    let identity = store
        .identity_key_pair()
        .await
        .map_err(RelayError::Protocol)?;
    let start: u32 = store.get_state(STATE_MAX_PREKEY_ID).await?.unwrap_or(1);
    let signed_id: u32 = store.get_state(STATE_SIGNED_KEY_ID).await?.unwrap_or(1);

    let mut pre_keys = Vec::with_capacity(PREKEY_BATCH_SIZE as usize);
    for id in start..start + PREKEY_BATCH_SIZE {
        let record = PreKeyRecord::generate(id);
        store.save_prekey(&record).await?;
        pre_keys.push(PreKeyEntity {
            key_id: id,
            public_key: STANDARD.encode(record.public),
        });
    }
    let signed = SignedPreKeyRecord::generate(&identity, signed_id);
    store.save_signed_prekey(&signed).await?;

    store
        .put_state(STATE_MAX_PREKEY_ID, &(start + PREKEY_BATCH_SIZE))
        .await?;
    store.put_state(STATE_SIGNED_KEY_ID, &(signed_id + 1)).await?;

    Ok(RegisterKeysRequest {
        identity_key: STANDARD.encode(identity.public().encode()),
        pre_keys,
        signed_pre_key: SignedPreKeyEntity {
            key_id: signed.id,
            public_key: STANDARD.encode(signed.public),
            signature: STANDARD.encode(&signed.signature),
        },
    })
}

pub async fn refresh_prekeys(
    store: &SignalStore,
    client: &dyn SignalClient,
) -> Result<(), RelayError> {
    let request = generate_keys(store).await?;
    client.register_keys(&request).await?;
    Ok(())
}
