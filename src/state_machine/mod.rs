/// The [`StateMachine`] trait provides calling semantics for the pure bookkeeping pieces of a call
/// (credit accounting and the call lifecycle).
///
/// # Functionality
/// State machines operate on defined inputs and outputs. The grouping is provided by the
/// associated types [`Input`](StateMachine::Input) and [`Output`](StateMachine::Output), which will
/// most often be an enum when there are multiple variants and a plain type in the single variant
/// case.
///
/// Method dispatch is defined by [`process_input`](StateMachine::process_input) and
/// [`poll_output`](StateMachine::poll_output). Inputs mutate state, outputs are drained by the
/// owner afterwards and turned into side effects (transport calls, log lines, wakeups).
///
/// # Invariants
/// A [`StateMachine`] must be pure: its behavior may not depend on anything outside of the inputs
/// it has been given. Implementors *must* uphold the following.
///
/// ## No Interior Mutability
/// All data is either immutable or mutated through `&mut` access only. No [`std::cell`] or
/// [`std::sync`] containers, no reference counted pointers.
///
/// ## No IO, No Time, No Concurrency
/// No [`std::io`], [`std::net`], clocks, threads or async. The owner of the state machine
/// (typically something holding the per-call lock) performs every impure action based on the
/// polled output.
///
/// ## No Blocking
/// Processing an input and polling an output always return promptly. This is what allows a state
/// machine to be driven while a per-call mutex is held by either the transport or the consumer.
///
/// # Side Effects
/// Logging is allowed as long as the logic never depends on it.
///
/// # Example
/// ```ignore
/// let mut credit = CreditController::new();
/// credit.process_input(Demand::Bounded(4));
///
/// while let Some(signal) = credit.poll_output() {
///     match signal {
///         FlowSignal::Request(n) => control.request_more(n),
///         FlowSignal::Resume => control.resume(),
///         FlowSignal::Pause => control.pause(),
///     }
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) from the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
