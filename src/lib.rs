pub mod bridge;
pub mod greeter;
pub mod state_machine;

pub use bridge::{
    CallError, CallId, CallShape, CallState, Demand, RpcChannel, RpcRouter, RxSingle, RxStream,
};
