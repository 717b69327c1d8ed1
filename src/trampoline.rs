//! Fixed-address indirection stubs at the head of JIT memory. Their
//! addresses are assigned before any JIT element, so every call site and
//! epilogue can reach them with a PC-relative offset.

use crate::builder::IsolationBuilder;
use crate::errors::EncodingError;
use crate::instr::{consolidate_bytes, Instr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    /// Indirect entry into a JIT element through CALL_TMP_REG.
    CallJitElt,
    /// Return path out of a JIT element.
    RetFromJitElt,
}

impl TrampolineKind {
    /// Layout order at the head of JIT memory.
    pub const ALL: [TrampolineKind; 2] = [TrampolineKind::CallJitElt, TrampolineKind::RetFromJitElt];

    pub fn label(&self) -> &'static str {
        match self {
            TrampolineKind::CallJitElt => "call_jit_elt",
            TrampolineKind::RetFromJitElt => "ret_from_jit_elt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trampoline {
    pub kind: TrampolineKind,
    pub address: u64,
    pub instructions: Vec<Instr>,
}

impl Trampoline {
    pub fn new(kind: TrampolineKind, address: u64, builder: &dyn IsolationBuilder) -> Self {
        let instructions = match kind {
            TrampolineKind::CallJitElt => builder.build_call_jit_elt_trampoline(),
            TrampolineKind::RetFromJitElt => builder.build_ret_from_jit_elt_trampoline(),
        };
        Self {
            kind,
            address,
            instructions,
        }
    }

    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    pub fn bytes(&self) -> Result<Vec<u8>, EncodingError> {
        consolidate_bytes(&self.instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BaseBuilder;
    use crate::constants::CALL_TMP_REG;

    #[test]
    fn check_base_trampoline_bodies() {
        let call = Trampoline::new(TrampolineKind::CallJitElt, 0x2000, &BaseBuilder);
        assert_eq!(call.instructions, vec![Instr::jr(CALL_TMP_REG)]);
        let ret = Trampoline::new(TrampolineKind::RetFromJitElt, 0x2004, &BaseBuilder);
        assert_eq!(ret.instructions, vec![Instr::ret()]);
    }

    #[test]
    fn check_labels() {
        assert_eq!(TrampolineKind::CallJitElt.label(), "call_jit_elt");
        assert_eq!(TrampolineKind::RetFromJitElt.label(), "ret_from_jit_elt");
    }
}
