//! RFC-3 PROTO: the fixed 20-byte header every message carries as its last
//! frame. See spec §4.4.

use weft_base::{proto, Result};

pub const PROTO_MAGIC: u8 = 0x8e;
pub const PROTO_VERSION: u8 = 1;
pub const PROTO_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Request = 0,
    Response = 1,
    Event = 2,
    Control = 3,
}

impl MsgType {
    fn from_u8(v: u8) -> Result<MsgType> {
        match v {
            0 => Ok(MsgType::Request),
            1 => Ok(MsgType::Response),
            2 => Ok(MsgType::Event),
            3 => Ok(MsgType::Control),
            _ => Err(proto(format!("unknown message type {v}"))),
        }
    }
}

bitflags::bitflags! {
    /// Flag bits set in the PROTO header (spec §4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const TOPIC      = 0x01;
        const PAYLOAD    = 0x02;
        const NORESPONSE = 0x04;
        const ROUTE      = 0x08;
        const UPSTREAM   = 0x10;
        const PRIVATE    = 0x20;
        const STREAMING  = 0x40;
        const USER1      = 0x80;
    }
}

/// The 20-byte wire header: magic, version, type, flags, userid, rolemask,
/// and two type-discriminated 32-bit aux fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proto {
    pub msg_type: MsgType,
    pub flags: Flags,
    pub userid: u32,
    pub rolemask: u32,
    pub aux1: u32,
    pub aux2: u32,
}

impl Proto {
    pub fn encode(&self) -> [u8; PROTO_SIZE] {
        let mut buf = [0u8; PROTO_SIZE];
        buf[0] = PROTO_MAGIC;
        buf[1] = PROTO_VERSION;
        buf[2] = self.msg_type as u8;
        buf[3] = self.flags.bits();
        buf[4..8].copy_from_slice(&self.userid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rolemask.to_be_bytes());
        buf[12..16].copy_from_slice(&self.aux1.to_be_bytes());
        buf[16..20].copy_from_slice(&self.aux2.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Proto> {
        if buf.len() != PROTO_SIZE {
            return Err(proto(format!(
                "PROTO frame must be {PROTO_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0] != PROTO_MAGIC {
            return Err(proto(format!("bad PROTO magic {:#x}", buf[0])));
        }
        if buf[1] != PROTO_VERSION {
            return Err(proto(format!("unsupported PROTO version {}", buf[1])));
        }
        let msg_type = MsgType::from_u8(buf[2])?;
        let flags = Flags::from_bits_truncate(buf[3]);
        let userid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let rolemask = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let aux1 = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let aux2 = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        Ok(Proto {
            msg_type,
            flags,
            userid,
            rolemask,
            aux1,
            aux2,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_request_vector() {
        // spec §8 scenario 1: userid=100, rolemask=OWNER(0x1),
        // flags=TOPIC|PAYLOAD|ROUTE (0x0b), aux1=nodeid ANY (0xffffffff), aux2=0.
        let p = Proto {
            msg_type: MsgType::Request,
            flags: Flags::TOPIC | Flags::PAYLOAD | Flags::ROUTE,
            userid: 100,
            rolemask: 0x1,
            aux1: 0xFFFF_FFFF,
            aux2: 0,
        };
        let want: [u8; 20] = [
            0x8e, 0x01, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00, 0x01, 0xff, 0xff,
            0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(p.encode(), want);
        let back = Proto::decode(&want).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; PROTO_SIZE];
        buf[1] = PROTO_VERSION;
        assert!(Proto::decode(&buf).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Proto::decode(&[0u8; 19]).is_err());
        assert!(Proto::decode(&[0u8; 21]).is_err());
    }
}
