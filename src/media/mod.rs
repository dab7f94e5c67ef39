//! Local media: tracks, streams, device abstraction, and the manager
//! that owns the local capture state.

pub mod devices;
pub mod manager;
pub mod track;

pub use devices::{
    AudioConstraints, DeviceSettings, MediaConstraints, MediaDeviceInfo, MediaDeviceKind,
    MediaDevices, VideoConstraints,
};
pub use manager::{LocalMediaManager, MediaEvent};
pub use track::{MediaSample, MediaStream, MediaTrack, SampleFormat, TrackKind, TrackSource};
