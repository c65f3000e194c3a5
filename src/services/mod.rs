pub mod enrichment_worker;
pub mod vision_prompts;
pub mod vision_service;

pub use enrichment_worker::{EnrichmentBackend, EnrichmentWorkerPool};
pub use vision_service::VisionService;
