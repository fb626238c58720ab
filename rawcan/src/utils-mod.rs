/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

use std::io;
use thiserror::Error;

/// Operation failures reported by the transport.
///
/// Would-block and malformed received frames are deliberately absent: both
/// are ordinary receive outcomes and travel through `CanRecv`, never through
/// this type.
#[derive(Debug, Error)]
pub enum CanError {
    /// Caller supplied data rejected before any I/O was attempted.
    #[error("invalid-argument: {0}")]
    InvalidArgument(&'static str),

    /// Transport level failure, wrapping the native cause.
    #[error("{uid}: {source}")]
    IoFail {
        uid: &'static str,
        #[source]
        source: io::Error,
    },
}

impl CanError {
    /// Capture errno right after a failed libc call.
    pub(crate) fn from_errno(uid: &'static str) -> CanError {
        CanError::IoFail {
            uid,
            source: io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_display() {
        let error = CanError::InvalidArgument("payload exceeds 8 bytes");
        assert_eq!(error.to_string(), "invalid-argument: payload exceeds 8 bytes");
    }

    #[test]
    fn iofail_keeps_native_cause() {
        let error = CanError::IoFail {
            uid: "fail-sockcan-read",
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        match error {
            CanError::IoFail { uid, source } => {
                assert_eq!(uid, "fail-sockcan-read");
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            CanError::InvalidArgument(_) => panic!("wrong variant"),
        }
    }
}
