//! Module defining the trait a problem must implement to be fought over.

/// Describes the instances generators must produce and the certificates solvers must return.
///
/// Implementations are shared read-only by every concurrently running battle, so every method
/// must be pure and side-effect free.
pub trait Problem: Send + Sync {
    /// Human readable name, used in logs.
    fn name(&self) -> &str;

    /// Smallest meaningful instance size. Iterative battles start here unless configured
    /// otherwise.
    fn min_size(&self) -> u64 {
        1
    }

    /// True if `instance` is a well-formed encoding of an instance of at most `size`.
    fn validate_instance(&self, instance: &[u8], size: u64) -> bool;

    /// True if `certificate` is well formed and actually solves `instance`.
    fn validate_certificate(&self, instance: &[u8], certificate: &[u8]) -> bool;

    /// How far a valid certificate is from optimal, as a ratio `>= 1.0`.
    ///
    /// Only called on certificates that passed [`validate_certificate`](Self::validate_certificate).
    /// Exact problems keep the default of `1.0`.
    fn approximation_ratio(&self, _instance: &[u8], _certificate: &[u8]) -> f64 {
        1.0
    }
}
