mod backend;
mod backends;
mod registry;
mod result;

pub use backend::Detector;
pub use backends::{DetectorSwitch, StubBackend, StubFixture};
pub use registry::DetectorRegistry;
pub use result::Detection;

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
