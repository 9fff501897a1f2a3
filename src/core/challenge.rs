use std::fmt::Debug;

use base64::prelude::*;
use rand::{rngs::OsRng, RngCore};

/// Number of random bytes behind every challenge and access token.
pub const CHALLENGE_BYTES: usize = 32;

/// Source of unguessable, single-use values: step challenges and session-scoped access tokens.
pub trait ChallengeGenerator: Debug {
    fn generate(&self) -> String;
}

/// A [ChallengeGenerator] backed by the operating system's CSPRNG.
///
/// 256 bits of entropy, base64url encoded without padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomChallenge;

impl ChallengeGenerator for RandomChallenge {
    fn generate(&self) -> String {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        BASE64_URL_SAFE_NO_PAD.encode(bytes)
    }
}
