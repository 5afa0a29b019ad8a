pub mod shutdown_handler;
pub mod tracing;
pub mod wire;

/// Packed slot count of one iris-code component: 16 rows x 256 cols x 2
/// complex components.
pub const IRIS_CODE_SLOTS: usize = 8192;

/// Rotations needed to collapse a slot vector into slot 0, ceil(log2(8192)).
pub const ROTATE_AND_SUM_ITERS: usize = 13;

/// BFV plaintext modulus; prime, t = 1 mod 2N so SIMD batching is available.
pub const PLAINTEXT_MODULUS: u64 = 65537;

/// Multiplicative depth the BFV parameters must support. One ciphertext
/// product suffices for a single inner-product reduction.
pub const MULT_DEPTH: usize = 1;

/// Fractional Hamming distance below which two iris codes are considered the
/// same identity, unless the request overrides it.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.39;
