//! Message codec and matching primitives: the PROTO wire header, the route
//! stack, credentials and authorization, the payload body, type/topic/
//! matchtag matching, and the `Message` type tying them together.
//!
//! See spec §3 and §4.4.

mod credentials;
mod matching;
mod message;
mod payload;
mod proto;
mod route;

pub use credentials::{Credentials, ROLEMASK_UNKNOWN, ROLE_OWNER, ROLE_USER, USERID_UNKNOWN};
pub use matching::{glob_match, Match, TypeMask, MATCHTAG_NONE};
pub use message::{Aux, Message, NODEID_ANY};
pub use payload::Payload;
pub use proto::{Flags, MsgType, Proto, PROTO_MAGIC, PROTO_SIZE, PROTO_VERSION};
pub use route::RouteStack;
