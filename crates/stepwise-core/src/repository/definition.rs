//! Definition document repository trait.
//!
//! The repository stores the raw definition document. Parsing, version checks,
//! and validation are the definition store's job, so every backend behaves
//! identically for malformed or unsupported documents.

use stepwise_types::error::RepositoryError;

/// Storage for the versioned workflow definition document.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Read the raw document. Returns `None` when nothing has been stored yet.
    fn read_document(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;

    /// Replace the stored document. Implementations must never leave a
    /// partially written document behind.
    fn write_document(
        &self,
        contents: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
