use std::fmt;

/// Which image a session delivers to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Application firmware.
    Flash,
    /// SPIFFS filesystem image.
    SpiFs,
}

impl CommandKind {
    /// Upload order when both images are supplied.
    pub const ALL: [CommandKind; 2] = [CommandKind::Flash, CommandKind::SpiFs];

    /// Integer tag sent as the first field of the invitation.
    pub fn code(self) -> u16 {
        match self {
            Self::Flash => 0,
            Self::SpiFs => 100,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Name of the multipart file field carrying this image.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Flash => "firmware",
            Self::SpiFs => "spiffs",
        }
    }

    pub fn from_field_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.field_name() == name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "Flash"),
            Self::SpiFs => write!(f, "SpiFS"),
        }
    }
}
