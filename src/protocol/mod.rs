//! Wire formats: the binary radio protocol spoken with nodes and the JSON
//! control plane spoken with the backend.

pub mod control;
pub mod options;
pub mod radio;

pub use control::{ControlError, ControlMessage, Setting, StatusinfoPost};
pub use options::{fft_params, FftParams, OptionError};
pub use radio::{decode, DecodeError, EncodeError, RadioPacket};
