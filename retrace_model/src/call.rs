use std::rc::Rc;

use crate::sig::{FunctionSig, StackFrame};
use crate::value::Value;

/// A call's position in the stream, assigned when its `leave` event is
/// parsed. Monotonically increasing within one trace.
pub type CallNo = u64;

/// One recorded API invocation.
///
/// Calls come out of the parser behind `Rc`: most consumers drop them
/// after one look, while the frame-loop cache keeps clones alive across
/// replay passes without copying argument trees.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub no: CallNo,
    pub thread_id: u64,
    pub sig: Rc<FunctionSig>,
    pub args: Vec<Value>,
    pub ret: Option<Value>,
    pub backtrace: Option<Vec<Rc<StackFrame>>>,
    /// `CALL_FLAG_*` bits: the signature's defaults plus any per-call
    /// adjustments made at parse completion.
    pub flags: u32,
}

impl Call {
    pub fn name(&self) -> &str {
        &self.sig.name
    }

    /// Argument by declaration position.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}
