pub mod expression; // Cross-field boolean expressions used by validation
pub mod ocr;
pub mod llm; // LLM client + process-wide circuit breakers
pub mod extraction;
pub mod consistency;
pub mod cleaning;
pub mod validation;
pub mod state; // Task lifecycle transitions
pub mod fingerprint; // Dedup + instant reuse
pub mod processor;
pub mod push;
pub mod review;
pub mod worker;
