pub mod presenter;
pub mod subsystems;

pub use subsystems::capture::{
    CameraDevice, CaptureConstraints, CaptureController, CaptureError, Frame, ImageFileCamera,
    SyntheticCamera, VideoSource,
};
pub use subsystems::channel::{ChannelEvent, ChannelState, FrameSender, StreamChannel};
pub use subsystems::session::{
    EndReason, SessionCommand, SessionController, SessionError, SessionNotice, SessionView,
};
