pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{DetectorSwitch, StubBackend, StubFixture};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
