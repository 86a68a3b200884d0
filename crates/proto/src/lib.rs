//! Lockstep wire protocol
//!
//! Frames exchanged between replicas and the reduction hub. Messages are
//! protobuf-encoded with prost and carried over TCP with a big-endian `u32`
//! length prefix.

pub mod codec;

pub use codec::{read_frame, write_frame, MAX_FRAME_BYTES};

/// First frame a replica sends after connecting
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(uint32, tag = "2")]
    pub size: u32,
    #[prost(string, tag = "3")]
    pub hostname: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub pid: u32,
}

/// Identity of one group member as recorded by the hub
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Member {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(string, tag = "2")]
    pub hostname: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub pid: u32,
}

/// Sent to every member once the whole group has joined
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
    #[prost(uint32, tag = "1")]
    pub size: u32,
    #[prost(string, tag = "2")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub members: ::prost::alloc::vec::Vec<Member>,
}

/// One rank's operand for its `seq`-th collective call
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Contribute {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(double, repeated, tag = "2")]
    pub values: ::prost::alloc::vec::Vec<f64>,
}

/// Elementwise sum of every rank's `seq`-th contribution
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reduced {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(double, repeated, tag = "2")]
    pub values: ::prost::alloc::vec::Vec<f64>,
}

/// Terminal error reported by the hub
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Fault {
    #[prost(enumeration = "FaultKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FaultKind {
    Unspecified = 0,
    /// Contributions for one `seq` had different lengths
    ShapeMismatch = 1,
    /// Two connections claimed the same rank
    DuplicateRank = 2,
    /// A joiner disagreed with the group size
    SizeMismatch = 3,
    /// Frame arrived out of protocol order
    Protocol = 4,
}

/// Envelope for every message on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: ::core::option::Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Join(super::Join),
        #[prost(message, tag = "2")]
        Welcome(super::Welcome),
        #[prost(message, tag = "3")]
        Contribute(super::Contribute),
        #[prost(message, tag = "4")]
        Reduced(super::Reduced),
        #[prost(message, tag = "5")]
        Fault(super::Fault),
    }
}

impl Frame {
    pub fn join(rank: u32, size: u32, hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            kind: Some(frame::Kind::Join(Join {
                rank,
                size,
                hostname: hostname.into(),
                pid,
            })),
        }
    }

    pub fn welcome(size: u32, run_id: impl Into<String>, members: Vec<Member>) -> Self {
        Self {
            kind: Some(frame::Kind::Welcome(Welcome {
                size,
                run_id: run_id.into(),
                members,
            })),
        }
    }

    pub fn contribute(seq: u64, values: Vec<f64>) -> Self {
        Self {
            kind: Some(frame::Kind::Contribute(Contribute { seq, values })),
        }
    }

    pub fn reduced(seq: u64, values: Vec<f64>) -> Self {
        Self {
            kind: Some(frame::Kind::Reduced(Reduced { seq, values })),
        }
    }

    pub fn fault(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Fault(Fault {
                kind: kind as i32,
                message: message.into(),
            })),
        }
    }

    /// Short name of the carried message, for logs
    pub fn name(&self) -> &'static str {
        match &self.kind {
            Some(frame::Kind::Join(_)) => "join",
            Some(frame::Kind::Welcome(_)) => "welcome",
            Some(frame::Kind::Contribute(_)) => "contribute",
            Some(frame::Kind::Reduced(_)) => "reduced",
            Some(frame::Kind::Fault(_)) => "fault",
            None => "empty",
        }
    }
}
