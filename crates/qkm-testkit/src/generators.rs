//! Proptest generators for property-based testing.

use proptest::prelude::*;

use qkm_core::Identity;
use qkm_crypto::SecurityMode;

/// Generate a mailbox identity.
pub fn identity() -> impl Strategy<Value = Identity> {
    "[a-z][a-z0-9.]{0,15}@[a-z]{1,10}\\.(com|org|net)"
        .prop_map(|s| Identity::parse(s).expect("generated identity is valid"))
}

/// Generate two distinct identities.
pub fn identity_pair() -> impl Strategy<Value = (Identity, Identity)> {
    (identity(), identity()).prop_filter("identities must differ", |(a, b)| a != b)
}

/// Generate a key size in bits within `[min, max]`.
pub fn key_size_bits(min: usize, max: usize) -> impl Strategy<Value = usize> {
    min..=max
}

/// Generate a channel error rate the simulator can converge under.
pub fn error_rate() -> impl Strategy<Value = f64> {
    0.0f64..0.2
}

/// Generate a security mode.
pub fn security_mode() -> impl Strategy<Value = SecurityMode> {
    prop::sample::select(SecurityMode::ALL.to_vec())
}

/// Generate payload bytes of specified max length.
pub fn plaintext(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Parameters for one mail exchange.
#[derive(Debug, Clone)]
pub struct MailParams {
    pub mode: SecurityMode,
    pub requester: Identity,
    pub recipient: Identity,
    pub plaintext: Vec<u8>,
}

/// Strategy for [`MailParams`] with payloads up to `max_len` bytes.
pub fn mail_params(max_len: usize) -> impl Strategy<Value = MailParams> {
    (security_mode(), identity_pair(), plaintext(max_len)).prop_map(
        |(mode, (requester, recipient), plaintext)| MailParams {
            mode,
            requester,
            recipient,
            plaintext,
        },
    )
}

impl Arbitrary for MailParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        // Fits a one-time pad under the default 8192-bit ceiling.
        mail_params(1024).boxed()
    }
}
