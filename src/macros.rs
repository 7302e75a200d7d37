//! Declarative helpers for the protocol's closed tables: command codes,
//! protocol revisions and TinyTuya-compatible error codes.

/// Declares `CommandType` with its numeric codes plus lookup helpers.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),+ $(,)?) => {
        /// Tuya command codes (TinyTuya numbering).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),+
        }

        impl CommandType {
            pub const ALL: &'static [CommandType] = &[$(CommandType::$name),+];

            /// Looks up a command by its wire code.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($val => Some(CommandType::$name),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(CommandType::$name => stringify!($name),)+
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Declares `Version` with its wire string and numeric value.
macro_rules! define_version {
    ($($name:ident = ($s:literal, $v:literal)),+ $(,)?) => {
        /// Tuya local protocol revision.
        ///
        /// Variants are ordered, so `version >= Version::V3_4` reads naturally.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Version {
            $($name),+
        }

        impl Version {
            pub const ALL: &'static [Version] = &[$(Version::$name),+];

            /// Wire representation, e.g. `"3.3"`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $s,)+
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$name => $v,)+
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($s => Ok(Version::$name),)+
                    other => Err($crate::error::TuyaError::UnsupportedVersion(other.to_string())),
                }
            }
        }

        impl TryFrom<f64> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(v: f64) -> std::result::Result<Self, Self::Error> {
                format!("{:.1}", v).parse()
            }
        }

        impl TryFrom<&str> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for Version {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for Version {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                #[derive(serde::Deserialize)]
                #[serde(untagged)]
                enum Repr {
                    Str(String),
                    Num(f64),
                }

                match Repr::deserialize(deserializer)? {
                    Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
                    Repr::Num(n) => Version::try_from(n).map_err(serde::de::Error::custom),
                }
            }
        }
    };
}

/// Declares error code constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),+ $(,)?) => {
        $(pub const $name: u32 = $code;)+

        /// Human readable text for a TinyTuya error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)+
                _ => "Unknown Error",
            }
        }
    };
}
