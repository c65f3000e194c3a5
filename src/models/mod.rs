pub mod aggregate;
pub mod backend;
pub mod document;
pub mod enrichment;
pub mod job;
pub mod loaders;
pub mod request;

pub use aggregate::{AggregateResult, AggregateStatus, ElementFailure, OutputElement, StructureTag};
pub use backend::{ParseBackend, VisionProvider};
pub use document::{BoundingBox, ElementKind, PageSize, ParseResult, StructuralElement};
pub use enrichment::{EnrichmentJob, EnrichmentResult, EnrichmentStatus, VisionOptions};
pub use job::{JobId, JobKind, JobState, ParseJob, Priority, SlotId, SlotSelector};
pub use loaders::{load_all_manifests, load_request_manifest};
pub use request::{DocumentRequest, RequestManifest};
