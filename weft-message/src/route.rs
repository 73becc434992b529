//! The routing stack carried by a message. See spec §4.4 "Routing stack
//! operations" and the worked example in spec §8 scenario 2.
//!
//! Internally the stack is a deque with the most-recently-pushed hop at the
//! front and the oldest (first-ever) hop at the back; `push` adds a hop at
//! the front (it is the hop closest to whoever handles the message next),
//! `append` seeds the far/oldest end, and `first()`/`last()` report by age
//! rather than by storage position.

use std::collections::VecDeque;
use weft_base::{proto, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStack {
    enabled: bool,
    // front = most recently pushed, back = oldest.
    routes: VecDeque<String>,
}

impl RouteStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn require_enabled(&self) -> Result<()> {
        if !self.enabled {
            return Err(proto("route operation on a message with routing disabled"));
        }
        Ok(())
    }

    /// Adds `id` as the newest hop.
    pub fn push(&mut self, id: impl Into<String>) -> Result<()> {
        self.require_enabled()?;
        self.routes.push_front(id.into());
        Ok(())
    }

    /// Adds `id` as the oldest hop (the far end of the envelope).
    pub fn append(&mut self, id: impl Into<String>) -> Result<()> {
        self.require_enabled()?;
        self.routes.push_back(id.into());
        Ok(())
    }

    /// Removes the newest hop.
    pub fn delete_last(&mut self) -> Result<()> {
        self.require_enabled()?;
        self.routes.pop_front();
        Ok(())
    }

    pub fn first(&self) -> Result<Option<&str>> {
        self.require_enabled()?;
        Ok(self.routes.back().map(String::as_str))
    }

    pub fn last(&self) -> Result<Option<&str>> {
        self.require_enabled()?;
        Ok(self.routes.front().map(String::as_str))
    }

    pub fn count(&self) -> Result<usize> {
        self.require_enabled()?;
        Ok(self.routes.len())
    }

    /// Oldest-to-newest hops joined with `!`, as in flux's diagnostic dumps.
    pub fn string(&self) -> Result<String> {
        self.require_enabled()?;
        Ok(self
            .routes
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("!"))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.require_enabled()?;
        self.routes.clear();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Frames in wire order: newest hop first, oldest last.
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(String::as_str)
    }

    /// Rebuilds a stack from frames in wire order (as produced by [`Self::frames`]).
    pub fn from_frames<'a>(frames: impl Iterator<Item = &'a [u8]>) -> Result<RouteStack> {
        let mut stack = RouteStack {
            enabled: true,
            routes: VecDeque::new(),
        };
        for frame in frames {
            let s = std::str::from_utf8(frame)
                .map_err(|_| proto("route frame is not valid UTF-8"))?;
            stack.routes.push_back(s.to_string());
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn route_manipulation_scenario() {
        let mut r = RouteStack::new();
        r.enable();
        r.push("sender").unwrap();
        assert_eq!(r.first().unwrap(), Some("sender"));
        assert_eq!(r.last().unwrap(), Some("sender"));
        assert_eq!(r.count().unwrap(), 1);
        assert_eq!(r.string().unwrap(), "sender");

        r.push("router").unwrap();
        assert_eq!(r.first().unwrap(), Some("sender"));
        assert_eq!(r.last().unwrap(), Some("router"));
        assert_eq!(r.string().unwrap(), "sender!router");

        r.delete_last().unwrap();
        assert_eq!(r.count().unwrap(), 1);
        assert_eq!(r.last().unwrap(), Some("sender"));
    }

    #[test]
    fn disabled_routes_reject_mutators() {
        let mut r = RouteStack::new();
        assert!(r.push("x").is_err());
        assert!(r.count().is_err());
    }

    #[test]
    fn push_pop_restores_prior_state() {
        let mut r = RouteStack::new();
        r.enable();
        r.push("a").unwrap();
        r.push("b").unwrap();
        let before = r.clone();
        r.push("c").unwrap();
        r.delete_last().unwrap();
        assert_eq!(r, before);
    }
}
