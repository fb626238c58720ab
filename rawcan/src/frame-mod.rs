/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/can.html#raw-protocol-sockets-with-can-filters-sock-raw
 *    linux/can.h (canid_t flag bits, struct can_frame layout)
 *
*/

use crate::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub type SockCanId = u32;

/// EFF_FLAG indicate 29 bit extended format
pub const CAN_EFF_FLAG: SockCanId = 0x8000_0000;
/// RTR_FLAG remote transmission request flag
pub const CAN_RTR_FLAG: SockCanId = 0x4000_0000;
/// ERR_FLAG error frame flag
pub const CAN_ERR_FLAG: SockCanId = 0x2000_0000;

/// SFF_MASK valid bits in standard frame id
pub const CAN_SFF_MASK: SockCanId = 0x0000_07FF;
/// EFF_MASK valid bits in extended frame id
pub const CAN_EFF_MASK: SockCanId = 0x1FFF_FFFF;
/// ERR_MASK valid bits in error frame
pub const CAN_ERR_MASK: SockCanId = 0x1FFF_FFFF;

/// Payload capacity of a classical CAN frame
pub const CAN_MAX_DLEN: usize = 8;
/// On-wire size of struct can_frame
pub const CAN_MTU: usize = 16;

const WIRE_LEN_OFFSET: usize = 4;
const WIRE_DATA_OFFSET: usize = 8;

/// Classical CAN identifier (aka CAN 2.0B).
///
/// Carries the numeric id plus the three kernel flag bits. The value is kept
/// unmasked so an id overflowing its addressing mode is reported by
/// [`CanId::is_valid`] instead of being silently truncated.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanId {
    value: u32,
    extended: bool,
    rtr: bool,
    err: bool,
}

impl CanId {
    /// Standard 11 bit identifier.
    pub fn new_std(value: u32) -> Self {
        CanId {
            value,
            extended: false,
            rtr: false,
            err: false,
        }
    }

    /// Extended 29 bit identifier.
    pub fn new_ext(value: u32) -> Self {
        CanId {
            value,
            extended: true,
            rtr: false,
            err: false,
        }
    }

    pub fn with_rtr(mut self, rtr: bool) -> Self {
        self.rtr = rtr;
        self
    }

    /// Unpack a kernel id word. Never fails: a nonsense word decodes into an
    /// id whose [`CanId::is_valid`] is false.
    pub fn from_raw(raw: SockCanId) -> Self {
        CanId {
            value: raw & CAN_ERR_MASK,
            extended: raw & CAN_EFF_FLAG != 0,
            rtr: raw & CAN_RTR_FLAG != 0,
            err: raw & CAN_ERR_FLAG != 0,
        }
    }

    /// Pack value and flags into the kernel id word. Does not validate;
    /// transmission paths must check [`CanId::is_valid`] first.
    pub fn get_raw(&self) -> SockCanId {
        let mut raw = self.value & CAN_ERR_MASK;
        if self.extended {
            raw |= CAN_EFF_FLAG;
        }
        if self.rtr {
            raw |= CAN_RTR_FLAG;
        }
        if self.err {
            raw |= CAN_ERR_FLAG;
        }
        raw
    }

    pub fn get_value(&self) -> u32 {
        self.value
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    pub fn is_error(&self) -> bool {
        self.err
    }

    /// An id is transmittable when the error flag is clear and the value fits
    /// its addressing mode (11 or 29 bits).
    pub fn is_valid(&self) -> bool {
        if self.err {
            return false;
        }
        let limit = if self.extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        self.value <= limit
    }
}

/// One classical CAN frame: identifier, payload length (0..=8) and the fixed
/// 8 byte data slot of the kernel ABI.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFrame {
    id: CanId,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    /// Build a frame from an id and payload. Oversize payloads are refused
    /// here, before any wire encoding. Id validity is checked on the send
    /// path, not at construction.
    pub fn new(id: CanId, payload: &[u8]) -> Result<Self, CanError> {
        if payload.len() > CAN_MAX_DLEN {
            return Err(CanError::InvalidArgument("payload exceeds 8 bytes"));
        }
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(CanFrame {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn get_id(&self) -> CanId {
        self.id
    }

    pub fn get_len(&self) -> u8 {
        self.len
    }

    /// Exactly the declared payload bytes, never the undefined tail of the
    /// 8 byte slot.
    pub fn get_data(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(CAN_MAX_DLEN)]
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_valid() && usize::from(self.len) <= CAN_MAX_DLEN
    }

    /// Serialize to the 16 byte struct can_frame image: id word in host byte
    /// order at offset 0, length at offset 4, three reserved bytes, data slot
    /// at offset 8. Reserved bytes and the data tail are zeroed; decoding
    /// never depends on them.
    pub fn to_wire(&self) -> [u8; CAN_MTU] {
        let mut wire = [0u8; CAN_MTU];
        wire[..WIRE_LEN_OFFSET].copy_from_slice(&self.id.get_raw().to_ne_bytes());
        wire[WIRE_LEN_OFFSET] = self.len;
        wire[WIRE_DATA_OFFSET..].copy_from_slice(&self.data);
        wire
    }

    /// Inverse of [`CanFrame::to_wire`]. Always syntactically successful;
    /// semantic checks are left to [`CanFrame::is_valid`] so a malformed
    /// frame can still expose its identifier for diagnostics.
    pub fn from_wire(wire: &[u8; CAN_MTU]) -> Self {
        let raw = SockCanId::from_ne_bytes([wire[0], wire[1], wire[2], wire[3]]);
        let mut data = [0u8; CAN_MAX_DLEN];
        data.copy_from_slice(&wire[WIRE_DATA_OFFSET..]);
        CanFrame {
            id: CanId::from_raw(raw),
            len: wire[WIRE_LEN_OFFSET],
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_id_boundaries() {
        assert!(CanId::new_std(0).is_valid());
        assert!(CanId::new_std(0x7FF).is_valid());
        assert!(!CanId::new_std(0x800).is_valid());
    }

    #[test]
    fn ext_id_boundaries() {
        assert!(CanId::new_ext(0x800).is_valid());
        assert!(CanId::new_ext(0x1FFF_FFFF).is_valid());
        assert!(!CanId::new_ext(0x2000_0000).is_valid());
    }

    #[test]
    fn error_flag_never_transmittable() {
        let id = CanId::from_raw(0x123 | CAN_ERR_FLAG);
        assert!(id.is_error());
        assert!(!id.is_valid());
    }

    #[test]
    fn raw_word_packs_flags() {
        let id = CanId::new_ext(0x123).with_rtr(true);
        assert_eq!(id.get_raw(), 0x123 | CAN_EFF_FLAG | CAN_RTR_FLAG);

        let back = CanId::from_raw(id.get_raw());
        assert_eq!(back, id);
        assert!(back.is_extended());
        assert!(back.is_rtr());
    }

    #[test]
    fn std_raw_word_has_no_flags() {
        assert_eq!(CanId::new_std(0x7FF).get_raw(), 0x7FF);
    }

    #[test]
    fn oversize_payload_refused() {
        let payload = [0u8; 9];
        match CanFrame::new(CanId::new_std(1), &payload) {
            Err(CanError::InvalidArgument(_)) => {}
            other => panic!("expected invalid-argument, got {other:?}"),
        }
    }

    #[test]
    fn wire_layout_is_fixed() {
        let frame = CanFrame::new(CanId::new_std(0x123), &[0xDE, 0xAD]).unwrap();
        let wire = frame.to_wire();

        assert_eq!(wire.len(), CAN_MTU);
        assert_eq!(wire[0..4], 0x123u32.to_ne_bytes());
        assert_eq!(wire[4], 2);
        assert_eq!(wire[5..8], [0, 0, 0]);
        assert_eq!(wire[8..10], [0xDE, 0xAD]);
        assert_eq!(wire[10..16], [0; 6]);
    }

    #[test]
    fn wire_round_trip() {
        let frame = CanFrame::new(
            CanId::new_ext(0x1ABC_DEF0).with_rtr(false),
            &[1, 2, 3, 4, 5, 6, 7, 8],
        )
        .unwrap();
        assert_eq!(CanFrame::from_wire(&frame.to_wire()), frame);
    }

    #[test]
    fn data_stops_at_declared_length() {
        let frame = CanFrame::new(CanId::new_std(0x42), &[9, 8, 7]).unwrap();
        assert_eq!(frame.get_data(), &[9, 8, 7]);
    }

    #[test]
    fn decoded_garbage_surfaces_through_is_valid() {
        // length byte beyond 8: syntactically decodable, semantically invalid
        let mut wire = CanFrame::new(CanId::new_std(0x42), &[1]).unwrap().to_wire();
        wire[4] = 9;
        let frame = CanFrame::from_wire(&wire);
        assert!(!frame.is_valid());
        assert_eq!(frame.get_id(), CanId::new_std(0x42));
        assert_eq!(frame.get_data().len(), CAN_MAX_DLEN);
    }
}
