/*!
 * Monitoring
 * Structured tracing setup for the allocator
 */

mod tracer;

pub use tracer::init_tracing;
