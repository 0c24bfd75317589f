//! Pure functions which map virtual cluster object identities onto physical
//! cluster names.
//!
//! The physical name of an object is always derived from its virtual name,
//! its virtual namespace and the suffix of the virtual cluster instance. No
//! mapping is ever persisted, the physical counterpart of a virtual object is
//! found by translating its identity again.
use std::fmt::Write as _;

use rand::Rng as _;
use sha2::{Digest as _, Sha256};

/// The maximum length of a Kubernetes object name which is also a valid DNS
/// label (RFC 1123).
pub const MAX_NAME_LENGTH: usize = 63;

/// Names exceeding [`MAX_NAME_LENGTH`] are cut to this length before the
/// hash suffix is appended.
const TRUNCATED_NAME_LENGTH: usize = 52;

/// The number of hex characters of the SHA-256 digest used as a suffix for
/// truncated names.
const HASH_SUFFIX_LENGTH: usize = 10;

/// The number of random characters appended to a `generateName` prefix.
pub const GENERATED_SUFFIX_LENGTH: usize = 5;

/// Same alphabet the API server uses for its name generator. Vowels are left
/// out to avoid generating words.
const GENERATED_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Returns the name of the physical object which backs the virtual object
/// `name` in the virtual namespace `namespace`.
///
/// The result is stable: the same inputs always produce the same name. Two
/// different virtual identities never map onto the same name unless the
/// result had to be hashed and the hashes collide.
///
/// ```
/// use vcluster_filters::translate::physical_name;
///
/// assert_eq!(physical_name("frontend", "web", "vcluster"), "frontend-x-web-x-vcluster");
/// ```
pub fn physical_name(name: &str, namespace: &str, suffix: &str) -> String {
    safe_concat_name(&[name, "x", namespace, "x", suffix])
}

/// Joins `parts` with `-`. If the result is longer than [`MAX_NAME_LENGTH`],
/// it is truncated and suffixed with a short hash of the full name, so that it
/// is still a valid and (practically) unique object name.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full_name = parts.join("-");
    if full_name.len() <= MAX_NAME_LENGTH {
        return full_name;
    }

    let digest = Sha256::digest(full_name.as_bytes());
    let mut hash = String::with_capacity(HASH_SUFFIX_LENGTH);
    for byte in digest.iter().take(HASH_SUFFIX_LENGTH / 2) {
        let _ = write!(hash, "{byte:02x}");
    }

    let truncated: String = full_name.chars().take(TRUNCATED_NAME_LENGTH).collect();
    let truncated = truncated.trim_end_matches(['-', '.']);

    format!("{truncated}-{hash}")
}

/// Produces a name from a `generateName` prefix by appending a short random
/// suffix, like the API server does when an object only requests a generated
/// name.
///
/// The result is not checked against existing objects. A collision surfaces as
/// a conflict when the object is created.
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let mut name = String::with_capacity(prefix.len() + GENERATED_SUFFIX_LENGTH);
    name.push_str(prefix);

    for _ in 0..GENERATED_SUFFIX_LENGTH {
        let index = rng.random_range(0..GENERATED_SUFFIX_ALPHABET.len());
        name.push(char::from(GENERATED_SUFFIX_ALPHABET[index]));
    }

    name
}
