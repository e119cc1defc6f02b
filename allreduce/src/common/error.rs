use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommErrorKind {
    UnsupportedDataType,
    InvalidTopology,
    ArgsNotSupport,
    TransportUnavailable,
    ChannelCreationFailure,
    RendezvousTimeout,
    KernelLaunchFailure,
}

#[derive(Clone, Debug)]
pub struct CommError {
    pub kind: CommErrorKind,
    pub info: String,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.info.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.info)
        }
    }
}

impl std::error::Error for CommError {}

pub(super) mod functions {
    use super::{CommError, CommErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(CommError: unsupported_data_type    UnsupportedDataType   );
    builder!(CommError: invalid_topology         InvalidTopology       );
    builder!(CommError: args_not_support         ArgsNotSupport        );
    builder!(CommError: transport_unavailable    TransportUnavailable  );
    builder!(CommError: channel_creation_failure ChannelCreationFailure);
    builder!(CommError: rendezvous_timeout       RendezvousTimeout     );

    builder!(CommError: kernel_launch_failure    KernelLaunchFailure   );
}

#[test]
fn test_display() {
    use functions::*;

    let e = transport_unavailable("need 8 network transports, pool has 4");
    assert_eq!(e.kind, CommErrorKind::TransportUnavailable);
    assert_eq!(
        e.to_string(),
        "TransportUnavailable: need 8 network transports, pool has 4"
    );
    assert_eq!(
        kernel_launch_failure("").to_string(),
        "KernelLaunchFailure"
    );
}
