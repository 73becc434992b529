//! The framed message itself: PROTO header plus route/topic/payload frames.
//! See spec §3 "Message" and §4.4.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use weft_base::{proto, Result};

use crate::payload::Payload;
use crate::proto::{Flags, MsgType, Proto};
use crate::route::RouteStack;

pub const NODEID_ANY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aux {
    Request { nodeid: u32, matchtag: u32 },
    Response { errnum: u32, matchtag: u32 },
    Event { sequence: u32 },
    Control { ctrl_type: u32, ctrl_status: u32 },
}

impl Aux {
    fn msg_type(&self) -> MsgType {
        match self {
            Aux::Request { .. } => MsgType::Request,
            Aux::Response { .. } => MsgType::Response,
            Aux::Event { .. } => MsgType::Event,
            Aux::Control { .. } => MsgType::Control,
        }
    }

    fn wire(&self) -> (u32, u32) {
        match *self {
            Aux::Request { nodeid, matchtag } => (nodeid, matchtag),
            Aux::Response { errnum, matchtag } => (errnum, matchtag),
            Aux::Event { sequence } => (sequence, 0),
            Aux::Control {
                ctrl_type,
                ctrl_status,
            } => (ctrl_type, ctrl_status),
        }
    }

    fn from_wire(msg_type: MsgType, aux1: u32, aux2: u32) -> Aux {
        match msg_type {
            MsgType::Request => Aux::Request {
                nodeid: aux1,
                matchtag: aux2,
            },
            MsgType::Response => Aux::Response {
                errnum: aux1,
                matchtag: aux2,
            },
            MsgType::Event => Aux::Event { sequence: aux1 },
            MsgType::Control => Aux::Control {
                ctrl_type: aux1,
                ctrl_status: aux2,
            },
        }
    }

    pub fn matchtag(&self) -> Option<u32> {
        match self {
            Aux::Request { matchtag, .. } | Aux::Response { matchtag, .. } => Some(*matchtag),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    aux: Aux,
    userid: u32,
    rolemask: u32,
    upstream: bool,
    private: bool,
    streaming: bool,
    noresponse: bool,
    user1: bool,
    routes: RouteStack,
    topic: Option<String>,
    payload: Payload,
    aux_slots: HashMap<String, Box<dyn Any>>,
    last_format_error: Option<String>,
}

/// A framed message. Cloning a `Message` is an "incref": the clone shares
/// the same underlying data (`Rc<RefCell<..>>`), matching the reference
/// counted semantics of spec §3/§4.4 "Copy and refcount" — Rust's `Rc`
/// already implements exactly this, so `incref`/`decref`/`destroy` are thin
/// aliases over `Clone`/`Drop` rather than a hand-rolled counter.
#[derive(Debug, Clone)]
pub struct Message(Rc<RefCell<Inner>>);

impl Message {
    fn new(aux: Aux, userid: u32, rolemask: u32) -> Message {
        Message(Rc::new(RefCell::new(Inner {
            aux,
            userid,
            rolemask,
            upstream: false,
            private: false,
            streaming: false,
            noresponse: false,
            user1: false,
            routes: RouteStack::new(),
            topic: None,
            payload: Payload::new(),
            aux_slots: HashMap::new(),
            last_format_error: None,
        })))
    }

    pub fn new_request(nodeid: u32, matchtag: u32, userid: u32, rolemask: u32) -> Message {
        Message::new(Aux::Request { nodeid, matchtag }, userid, rolemask)
    }

    pub fn new_response(errnum: u32, matchtag: u32, userid: u32, rolemask: u32) -> Message {
        Message::new(Aux::Response { errnum, matchtag }, userid, rolemask)
    }

    pub fn new_event(sequence: u32, userid: u32, rolemask: u32) -> Message {
        Message::new(Aux::Event { sequence }, userid, rolemask)
    }

    pub fn new_control(ctrl_type: u32, ctrl_status: u32, userid: u32, rolemask: u32) -> Message {
        Message::new(Aux::Control {
            ctrl_type,
            ctrl_status,
        }, userid, rolemask)
    }

    pub fn msg_type(&self) -> MsgType {
        self.0.borrow().aux.msg_type()
    }

    pub fn aux(&self) -> Aux {
        self.0.borrow().aux
    }

    pub fn userid(&self) -> u32 {
        self.0.borrow().userid
    }

    pub fn rolemask(&self) -> u32 {
        self.0.borrow().rolemask
    }

    pub fn credentials(&self) -> crate::credentials::Credentials {
        let inner = self.0.borrow();
        crate::credentials::Credentials::new(inner.userid, inner.rolemask)
    }

    /// An "incref": returns another handle sharing the same data.
    pub fn incref(&self) -> Message {
        self.clone()
    }

    /// A "decref": dropping the handle. Equivalent to letting `self` go out
    /// of scope; provided for symmetry with `incref` at call sites that want
    /// to be explicit.
    pub fn decref(self) {
        drop(self)
    }

    /// Equivalent to `decref` of the last owner.
    pub fn destroy(self) {
        drop(self)
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// A deep copy, optionally omitting the payload.
    pub fn copy(&self, with_payload: bool) -> Message {
        let inner = self.0.borrow();
        let mut aux_slots = HashMap::new();
        let _ = &aux_slots; // aux slots are not deep-cloneable (type-erased); a copy starts empty.
        Message(Rc::new(RefCell::new(Inner {
            aux: inner.aux,
            userid: inner.userid,
            rolemask: inner.rolemask,
            upstream: inner.upstream,
            private: inner.private,
            streaming: inner.streaming,
            noresponse: inner.noresponse,
            user1: inner.user1,
            routes: inner.routes.clone(),
            topic: inner.topic.clone(),
            payload: if with_payload {
                inner.payload.clone()
            } else {
                Payload::new()
            },
            aux_slots: HashMap::new(),
            last_format_error: inner.last_format_error.clone(),
        })))
    }

    // --- flags ---

    pub fn set_streaming(&self, on: bool) {
        let mut inner = self.0.borrow_mut();
        inner.streaming = on;
        if on {
            inner.noresponse = false;
        }
    }

    pub fn set_noresponse(&self, on: bool) {
        let mut inner = self.0.borrow_mut();
        inner.noresponse = on;
        if on {
            inner.streaming = false;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.0.borrow().streaming
    }

    pub fn is_noresponse(&self) -> bool {
        self.0.borrow().noresponse
    }

    pub fn set_upstream(&self, on: bool) {
        self.0.borrow_mut().upstream = on;
    }

    pub fn is_upstream(&self) -> bool {
        self.0.borrow().upstream
    }

    pub fn set_private(&self, on: bool) {
        self.0.borrow_mut().private = on;
    }

    pub fn is_private(&self) -> bool {
        self.0.borrow().private
    }

    pub fn set_user1(&self, on: bool) {
        self.0.borrow_mut().user1 = on;
    }

    pub fn is_user1(&self) -> bool {
        self.0.borrow().user1
    }

    // --- routes ---

    pub fn enable_routing(&self) {
        self.0.borrow_mut().routes.enable();
    }

    pub fn route_push(&self, id: impl Into<String>) -> Result<()> {
        self.0.borrow_mut().routes.push(id)
    }

    pub fn route_append(&self, id: impl Into<String>) -> Result<()> {
        self.0.borrow_mut().routes.append(id)
    }

    pub fn route_delete_last(&self) -> Result<()> {
        self.0.borrow_mut().routes.delete_last()
    }

    pub fn route_first(&self) -> Result<Option<String>> {
        Ok(self.0.borrow().routes.first()?.map(str::to_string))
    }

    pub fn route_last(&self) -> Result<Option<String>> {
        Ok(self.0.borrow().routes.last()?.map(str::to_string))
    }

    pub fn route_count(&self) -> Result<usize> {
        self.0.borrow().routes.count()
    }

    pub fn route_string(&self) -> Result<String> {
        self.0.borrow().routes.string()
    }

    // --- topic ---

    pub fn set_topic(&self, topic: impl Into<String>) {
        self.0.borrow_mut().topic = Some(topic.into());
    }

    pub fn topic(&self) -> Option<String> {
        self.0.borrow().topic.clone()
    }

    // --- payload ---

    pub fn set_payload(&self, bytes: impl Into<Vec<u8>>) {
        self.0.borrow_mut().payload.set_raw(bytes);
    }

    pub fn payload(&self) -> Option<Vec<u8>> {
        self.0.borrow().payload.raw().map(<[u8]>::to_vec)
    }

    pub fn set_payload_json(&self, v: &serde_json::Value) -> Result<()> {
        self.0.borrow_mut().payload.set_json(v)
    }

    pub fn payload_json(&self) -> Result<serde_json::Value> {
        self.0.borrow().payload.get_json()
    }

    pub fn pack(&self, fields: &[(&str, serde_json::Value)]) -> Result<()> {
        let res = self.0.borrow_mut().payload.pack(fields);
        self.remember_format_error(&res);
        res
    }

    pub fn unpack(&self, names: &[&str]) -> Result<Vec<serde_json::Value>> {
        let res = self.0.borrow().payload.unpack(names);
        self.remember_format_error(&res);
        res
    }

    fn remember_format_error<T>(&self, res: &Result<T>) {
        if let Err(e) = res {
            self.0.borrow_mut().last_format_error = Some(e.to_string());
        }
    }

    pub fn last_format_error(&self) -> Option<String> {
        self.0.borrow().last_format_error.clone()
    }

    // --- aux slots ---

    pub fn set_aux<T: Any>(&self, name: impl Into<String>, val: T) {
        self.0.borrow_mut().aux_slots.insert(name.into(), Box::new(val));
    }

    pub fn remove_aux(&self, name: &str) {
        self.0.borrow_mut().aux_slots.remove(name);
    }

    pub fn has_aux(&self, name: &str) -> bool {
        self.0.borrow().aux_slots.contains_key(name)
    }

    // --- encode / decode ---

    fn flags(&self) -> Flags {
        let inner = self.0.borrow();
        let mut f = Flags::empty();
        if inner.topic.is_some() {
            f |= Flags::TOPIC;
        }
        if inner.payload.is_present() {
            f |= Flags::PAYLOAD;
        }
        if !inner.routes.is_empty() {
            f |= Flags::ROUTE;
        }
        if inner.noresponse {
            f |= Flags::NORESPONSE;
        }
        if inner.upstream {
            f |= Flags::UPSTREAM;
        }
        if inner.private {
            f |= Flags::PRIVATE;
        }
        if inner.streaming {
            f |= Flags::STREAMING;
        }
        if inner.user1 {
            f |= Flags::USER1;
        }
        f
    }

    fn proto_header(&self) -> Proto {
        let inner = self.0.borrow();
        let (aux1, aux2) = inner.aux.wire();
        Proto {
            msg_type: inner.aux.msg_type(),
            flags: self.flags(),
            userid: inner.userid,
            rolemask: inner.rolemask,
            aux1,
            aux2,
        }
    }

    /// Encodes the message into an ordered list of frames, PROTO last.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let inner = self.0.borrow();
        let mut frames = Vec::new();
        if !inner.routes.is_empty() {
            for r in inner.routes.frames() {
                frames.push(r.as_bytes().to_vec());
            }
            frames.push(Vec::new()); // zero-length delimiter
        }
        if let Some(topic) = &inner.topic {
            frames.push(topic.as_bytes().to_vec());
        }
        if let Some(payload) = inner.payload.raw() {
            frames.push(payload.to_vec());
        }
        drop(inner);
        frames.push(self.proto_header().encode().to_vec());
        frames
    }

    /// Decodes a message from an ordered list of frames, PROTO last.
    pub fn decode(frames: &[Vec<u8>]) -> Result<Message> {
        let Some((proto_bytes, rest)) = frames.split_last() else {
            return Err(proto("message has no frames"));
        };
        let hdr = Proto::decode(proto_bytes)?;
        let mut rest = rest;

        let mut routes = RouteStack::new();
        if hdr.flags.contains(Flags::ROUTE) {
            let mut idx = 0;
            let mut found_delim = false;
            let mut route_frames = Vec::new();
            while idx < rest.len() {
                if rest[idx].is_empty() {
                    found_delim = true;
                    idx += 1;
                    break;
                }
                route_frames.push(rest[idx].as_slice());
                idx += 1;
            }
            if !found_delim {
                return Err(proto("ROUTE flag set but delimiter frame is missing"));
            }
            routes = RouteStack::from_frames(route_frames.into_iter())?;
            rest = &rest[idx..];
        }

        let topic = if hdr.flags.contains(Flags::TOPIC) {
            let Some((first, remainder)) = rest.split_first() else {
                return Err(proto("TOPIC flag set but topic frame is missing"));
            };
            rest = remainder;
            Some(
                String::from_utf8(first.clone())
                    .map_err(|_| proto("topic frame is not valid UTF-8"))?,
            )
        } else {
            None
        };

        let payload = if hdr.flags.contains(Flags::PAYLOAD) {
            let Some((first, remainder)) = rest.split_first() else {
                return Err(proto("PAYLOAD flag set but payload frame is missing"));
            };
            rest = remainder;
            Some(first.clone())
        } else {
            None
        };

        if !rest.is_empty() {
            return Err(proto("trailing frames after PROTO-declared fields"));
        }

        let aux = Aux::from_wire(hdr.msg_type, hdr.aux1, hdr.aux2);
        let msg = Message::new(aux, hdr.userid, hdr.rolemask);
        {
            let mut inner = msg.0.borrow_mut();
            inner.streaming = hdr.flags.contains(Flags::STREAMING);
            inner.noresponse = hdr.flags.contains(Flags::NORESPONSE);
            inner.upstream = hdr.flags.contains(Flags::UPSTREAM);
            inner.private = hdr.flags.contains(Flags::PRIVATE);
            inner.user1 = hdr.flags.contains(Flags::USER1);
            inner.routes = routes;
            inner.topic = topic;
            if let Some(p) = payload {
                inner.payload.set_raw(p);
            }
        }
        Ok(msg)
    }

    /// A one-line human-readable dump of the message's frames, for
    /// diagnostics (ported from flux's `message_fprint.c` behavior).
    pub fn fmt_frames(&self) -> String {
        let inner = self.0.borrow();
        let mut s = format!("{:?} flags={:#x}", inner.aux.msg_type(), self.flags().bits());
        if inner.routes.count().unwrap_or(0) > 0 {
            s.push_str(&format!(" routes={}", inner.routes.string().unwrap_or_default()));
        }
        if let Some(t) = &inner.topic {
            s.push_str(&format!(" topic={t}"));
        }
        if let Some(p) = inner.payload.raw() {
            s.push_str(&format!(" payload={}B", p.len()));
        }
        s
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_request_with_everything() {
        let msg = Message::new_request(NODEID_ANY, 42, 100, crate::credentials::ROLE_OWNER);
        msg.enable_routing();
        msg.route_append("origin").unwrap();
        msg.set_topic("a.b.c");
        msg.set_payload(b"hello".to_vec());

        let frames = msg.encode();
        let back = Message::decode(&frames).unwrap();

        assert_eq!(back.msg_type(), MsgType::Request);
        assert_eq!(back.userid(), 100);
        assert_eq!(back.topic().as_deref(), Some("a.b.c"));
        assert_eq!(back.payload().as_deref(), Some(&b"hello"[..]));
        assert_eq!(back.route_count().unwrap(), 1);
        assert_eq!(back.route_first().unwrap().as_deref(), Some("origin"));
        assert_eq!(back.aux(), Aux::Request { nodeid: NODEID_ANY, matchtag: 42 });
    }

    #[test]
    fn round_trip_minimal_message() {
        let msg = Message::new_event(7, 0, 0);
        let frames = msg.encode();
        let back = Message::decode(&frames).unwrap();
        assert_eq!(back.aux(), Aux::Event { sequence: 7 });
        assert!(back.topic().is_none());
        assert!(back.payload().is_none());
    }

    #[test]
    fn streaming_and_noresponse_are_exclusive() {
        let msg = Message::new_request(0, 0, 0, 0);
        msg.set_streaming(true);
        assert!(msg.is_streaming());
        msg.set_noresponse(true);
        assert!(msg.is_noresponse());
        assert!(!msg.is_streaming());
        msg.set_streaming(true);
        assert!(!msg.is_noresponse());
    }

    #[test]
    fn incref_shares_state_decref_drops_handle() {
        let msg = Message::new_event(1, 0, 0);
        assert_eq!(msg.refcount(), 1);
        let h2 = msg.incref();
        assert_eq!(msg.refcount(), 2);
        h2.set_topic("shared");
        assert_eq!(msg.topic().as_deref(), Some("shared"));
        h2.decref();
        assert_eq!(msg.refcount(), 1);
    }

    #[test]
    fn copy_without_payload_omits_it() {
        let msg = Message::new_event(1, 0, 0);
        msg.set_payload(b"secret".to_vec());
        msg.set_topic("t");
        let c = msg.copy(false);
        assert_eq!(c.topic().as_deref(), Some("t"));
        assert!(c.payload().is_none());
        // independent copy: mutating the copy must not affect the original
        c.set_topic("other");
        assert_eq!(msg.topic().as_deref(), Some("t"));
    }

    #[test]
    fn decode_rejects_missing_route_delimiter() {
        let msg = Message::new_event(1, 0, 0);
        msg.enable_routing();
        msg.route_push("x").unwrap();
        let mut frames = msg.encode();
        // drop the delimiter frame (second-to-last before proto, minus one)
        let proto_frame = frames.pop().unwrap();
        frames.pop(); // remove delimiter
        frames.push(proto_frame);
        assert!(Message::decode(&frames).is_err());
    }
}
