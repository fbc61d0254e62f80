//! Audio subsystem module

pub mod buffer;
#[cfg(feature = "device-capture")]
pub mod capture;
#[cfg(feature = "device-capture")]
pub mod device;
pub mod source;
pub mod synthetic;

pub use buffer::{CircularAudioBuffer, SampleReader, SampleWriter};
#[cfg(feature = "device-capture")]
pub use capture::CpalSource;
#[cfg(feature = "device-capture")]
pub use device::{find_input_device, list_input_devices, InputDeviceInfo};
pub use source::{BatchCallback, CallbackSlot, SampleSource};
pub use synthetic::{ToneGenerator, ToneSource};
