use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use crate::HookError;

#[cfg(target_pointer_width = "64")]
const BITNESS: u32 = 64;
#[cfg(target_pointer_width = "64")]
const JMP_REL32: Code = Code::Jmp_rel32_64;

#[cfg(target_pointer_width = "32")]
const BITNESS: u32 = 32;
#[cfg(target_pointer_width = "32")]
const JMP_REL32: Code = Code::Jmp_rel32_32;

pub(super) const MAX_INST_LEN: usize = 15;

/// Decodes whole instructions of `code`, which lives at `ip`, until at least
/// `min_len` bytes are covered.
pub(super) fn decode_prologue(
    code: &[u8],
    ip: u64,
    min_len: usize,
) -> Result<Vec<Instruction>, HookError> {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip, DecoderOptions::NONE);
    let mut insts = vec![];
    let mut len = 0;
    while len < min_len {
        if !decoder.can_decode() {
            return Err(HookError::Disassemble);
        }
        let inst = decoder.decode();
        if inst.is_invalid() {
            return Err(HookError::Disassemble);
        }
        len += inst.len();
        let leaves = matches!(
            inst.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        insts.push(inst);
        if leaves && len < min_len {
            // the jump would overwrite whatever follows the function
            return Err(HookError::FunctionTooShort(ip as usize));
        }
    }
    Ok(insts)
}

/// The stolen instructions as re-encoded for the trampoline.
pub(super) struct Moved {
    pub code: Vec<u8>,
    /// (offset in the target, offset in `code`) of every instruction, the
    /// jump back last.
    pub offsets: Vec<(usize, usize)>,
}

/// Re-encodes the stolen instructions at `dest_addr` followed by a jump back
/// to the first instruction that was not stolen.
pub(super) fn move_code_to_addr(ori_insts: &[Instruction], dest_addr: u64) -> Result<Moved, HookError> {
    let first = ori_insts.first().ok_or(HookError::MoveCode)?.ip();
    let resume_addr = ori_insts.last().ok_or(HookError::MoveCode)?.next_ip();
    let mut insts = ori_insts.to_vec();
    insts.push(Instruction::with_branch(JMP_REL32, resume_addr).map_err(|_| HookError::MoveCode)?);
    let block = InstructionBlock::new(&insts, dest_addr);
    let encoded = BlockEncoder::encode(
        BITNESS,
        block,
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )
    .map_err(|_| HookError::MoveCode)?;

    let old_offsets = ori_insts
        .iter()
        .map(|inst| inst.ip())
        .chain([resume_addr])
        .map(|ip| (ip - first) as usize);
    let offsets = old_offsets
        .zip(encoded.new_instruction_offsets)
        .filter(|(_, new)| *new != u32::MAX)
        .map(|(old, new)| (old, new as usize))
        .collect();
    Ok(Moved {
        code: encoded.code_buffer,
        offsets,
    })
}
