use std::fmt;

/// How many messages a direction of a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one message.
    One,
    /// Any number of messages, including zero.
    Many,
}

/// The cardinality pattern of a call, request side first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    SingleSingle,
    SingleStream,
    StreamSingle,
    StreamStream,
}

impl CallShape {
    pub fn request_cardinality(&self) -> Cardinality {
        match self {
            CallShape::SingleSingle | CallShape::SingleStream => Cardinality::One,
            CallShape::StreamSingle | CallShape::StreamStream => Cardinality::Many,
        }
    }

    pub fn response_cardinality(&self) -> Cardinality {
        match self {
            CallShape::SingleSingle | CallShape::StreamSingle => Cardinality::One,
            CallShape::SingleStream | CallShape::StreamStream => Cardinality::Many,
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallShape::SingleSingle => "single-single",
            CallShape::SingleStream => "single-stream",
            CallShape::StreamSingle => "stream-single",
            CallShape::StreamStream => "stream-stream",
        })
    }
}
