pub mod discovery;
pub mod hashing;

pub use discovery::{discover_images, DiscoveryError};
pub use hashing::{
    are_similar, compute_fingerprint, compute_fingerprint_file, hamming_distance, HashError,
    PerceptualHash, DEFAULT_SIMILARITY_THRESHOLD,
};
