//! Port trait for the SCALE decoder.
//!
//! Decoding is CPU-bound and synchronous. Callers guard it against panics.

use crate::error::DomainResult;
use crate::models::{DecodedEvent, DecodedExtrinsic, DecodedLog, RuntimeMetadata};

/// Turns raw hex block data into structured records for a given runtime.
pub trait BlockDecoder: Send + Sync {
    /// Decode the block's extrinsics.
    fn decode_extrinsics(
        &self,
        raw: &[String],
        metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedExtrinsic>>;

    /// Decode the `System.Events` storage value.
    fn decode_events(
        &self,
        raw: &str,
        metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedEvent>>;

    /// Decode the header digest items.
    fn decode_logs(&self, raw: &[String]) -> DomainResult<Vec<DecodedLog>>;

    /// Module names present in the metadata.
    fn module_names(&self, metadata: &RuntimeMetadata) -> DomainResult<Vec<String>>;
}
