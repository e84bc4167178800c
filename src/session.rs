//! Session identity
//!
//! A session is addressed only by its name. Operators may supply one;
//! otherwise a short random name is generated. Uniqueness is not checked
//! here, collisions are settled by discovery.

use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Alphabet for generated names
pub const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated names
pub const GENERATED_NAME_LEN: usize = 6;

/// Process-wide random source, seeded once on first use
static NAME_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn name_rng() -> &'static Mutex<StdRng> {
    NAME_RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Name of a relay session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionName(String);

impl SessionName {
    /// Wrap an operator-supplied name
    ///
    /// Names are opaque: any non-empty string is kept byte for byte. Routes
    /// percent-encode it where needed.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidSessionName {
                name,
                reason: "name is empty".to_string(),
            });
        }
        Ok(Self(name))
    }

    /// Generate a random name of [`GENERATED_NAME_LEN`] characters
    pub fn generate() -> Self {
        let mut rng = name_rng().lock();
        let name: String = (0..GENERATED_NAME_LEN)
            .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
            .collect();
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Use the supplied name verbatim, or generate one when none was given
pub fn resolve_name(supplied: Option<&str>) -> Result<SessionName> {
    match supplied {
        Some(name) if !name.is_empty() => SessionName::new(name),
        _ => Ok(SessionName::generate()),
    }
}
