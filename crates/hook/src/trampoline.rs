use iced_x86::{Decoder, DecoderOptions, Instruction};

use grapple_address::Address;
use grapple_profile::{Architecture, ArgumentLocator, ArgumentSlot, Completion};
use grapple_profile::Register as SlotRegister;
use grapple_signal::Marker;

use crate::error::HookError;

/// Bytes reserved in the target for every trampoline.
pub const TRAMPOLINE_CAPACITY: usize = 0x400;

pub const REL32_JUMP_LENGTH: usize = 5;
pub const ABSOLUTE_JUMP_LENGTH: usize = 14;

const NOP: u8 = 0x90;

// pushfq + 15 general purpose registers
const SAVED_STATE_X64: i32 = 0x80;
// pushfd + pushad
const SAVED_STATE_X86: i32 = 0x24;
// Shadow space for the handler followed by xmm0-xmm7
const VECTOR_FRAME_X64: i32 = 0xA0;
const SHADOW_SPACE_X64: i32 = 0x20;

/// Where a marker sends the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEntry {
    pub marker: Marker,
    pub handler: Address,
    pub completion: Completion,
}

/// Code that runs in place of the patched bytes.
///
/// Layout: save flags and registers, walk the argument locator to the string's code units,
/// compare the leading 32-bit word against every dispatch entry and call the matching
/// handler with a pointer to the units after the marker. Afterwards either restore and
/// return the entry's value, or restore and continue with the relocated original
/// instructions followed by a jump back behind the patch.
pub struct Trampoline<'a> {
    pub architecture: Architecture,
    pub argument: &'a ArgumentLocator,
    pub dispatch: &'a [DispatchEntry],
    pub relocated: &'a [Instruction],
    pub resume: Address,
}

impl Trampoline<'_> {
    pub fn assemble(&self, at: Address) -> Result<Vec<u8>, HookError> {
        let code = match self.architecture {
            Architecture::X86 => self.assemble_x86(at)?,
            Architecture::X86_64 => self.assemble_x64(at)?,
        };

        if code.len() > TRAMPOLINE_CAPACITY {
            return Err(HookError::Assembly(format!(
                "trampoline is {:#x} bytes, only {:#x} are reserved",
                code.len(),
                TRAMPOLINE_CAPACITY,
            )));
        }

        Ok(code)
    }

    fn assemble_x64(&self, at: Address) -> Result<Vec<u8>, HookError> {
        use iced_x86::code_asm::*;

        let saved = [rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15];
        let vectors = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];

        let restore = |assembler: &mut CodeAssembler| -> Result<(), iced_x86::IcedError> {
            for (index, register) in vectors.iter().enumerate() {
                let slot = SHADOW_SPACE_X64 + 0x10 * index as i32;
                assembler.movdqu(*register, xmmword_ptr(rsp + slot))?;
            }
            assembler.mov(rsp, rbx)?;
            for register in saved.iter().rev() {
                assembler.pop(*register)?;
            }
            assembler.popfq()
        };

        let mut assembler = CodeAssembler::new(64)?;
        let mut done = assembler.create_label();

        assembler.pushfq()?;
        for register in saved.iter() {
            assembler.push(*register)?;
        }

        match self.argument.slot {
            ArgumentSlot::Register(register) => assembler.mov(rax, gpr64(register))?,
            ArgumentSlot::Stack(displacement) => {
                assembler.mov(rax, qword_ptr(rsp + (SAVED_STATE_X64 + displacement as i32)))?
            },
        }
        for displacement in self.argument.indirections.iter() {
            assembler.mov(rax, qword_ptr(rax + *displacement))?;
        }
        assembler.lea(rax, ptr(rax + self.argument.payload_offset))?;
        assembler.mov(edx, dword_ptr(rax + 0))?;
        assembler.lea(rax, ptr(rax + 4))?;

        // Handlers run on an aligned stack with xmm0-xmm7 parked above their shadow space.
        assembler.mov(rbx, rsp)?;
        assembler.and(rsp, -0x10)?;
        assembler.sub(rsp, VECTOR_FRAME_X64)?;
        for (index, register) in vectors.iter().enumerate() {
            let slot = SHADOW_SPACE_X64 + 0x10 * index as i32;
            assembler.movdqu(xmmword_ptr(rsp + slot), *register)?;
        }

        for (index, entry) in self.dispatch.iter().enumerate() {
            let last = index + 1 == self.dispatch.len();
            let mut next = if last { done } else { assembler.create_label() };

            assembler.cmp(edx, entry.marker.word() as i32)?;
            assembler.jne(next)?;
            // First argument under both the Microsoft and System V conventions.
            assembler.mov(rcx, rax)?;
            assembler.mov(rdi, rax)?;
            assembler.mov(r11, entry.handler.as_u64())?;
            assembler.call(r11)?;

            match entry.completion {
                Completion::FallThrough => assembler.jmp(done)?,
                Completion::Return { value, stack_bytes } => {
                    restore(&mut assembler)?;
                    assembler.mov(rax, value)?;
                    match stack_bytes {
                        0 => assembler.ret()?,
                        bytes => assembler.ret_1(i32::from(bytes))?,
                    }
                },
            }

            if !last {
                assembler.set_label(&mut next)?;
            }
        }

        assembler.set_label(&mut done)?;
        restore(&mut assembler)?;

        for instruction in self.relocated.iter() {
            assembler.add_instruction(*instruction)?;
        }

        let mut resume = assembler.create_label();
        assembler.jmp(qword_ptr(resume))?;
        assembler.set_label(&mut resume)?;
        assembler.dq(&[self.resume.as_u64()])?;

        Ok(assembler.assemble(at.as_u64())?)
    }

    fn assemble_x86(&self, at: Address) -> Result<Vec<u8>, HookError> {
        use iced_x86::code_asm::*;

        let mut assembler = CodeAssembler::new(32)?;
        let mut done = assembler.create_label();

        assembler.pushfd()?;
        assembler.pushad()?;

        match self.argument.slot {
            ArgumentSlot::Register(register) => assembler.mov(eax, gpr32(register)?)?,
            ArgumentSlot::Stack(displacement) => {
                assembler.mov(eax, dword_ptr(esp + (SAVED_STATE_X86 + displacement as i32)))?
            },
        }
        for displacement in self.argument.indirections.iter() {
            assembler.mov(eax, dword_ptr(eax + *displacement))?;
        }
        assembler.lea(eax, ptr(eax + self.argument.payload_offset))?;
        assembler.mov(edx, dword_ptr(eax + 0))?;
        assembler.lea(eax, ptr(eax + 4))?;

        assembler.mov(ebx, esp)?;
        assembler.and(esp, -0x10)?;

        for (index, entry) in self.dispatch.iter().enumerate() {
            let last = index + 1 == self.dispatch.len();
            let mut next = if last { done } else { assembler.create_label() };

            assembler.cmp(edx, entry.marker.word() as i32)?;
            assembler.jne(next)?;
            // cdecl, the stack is 16-byte aligned at the call.
            assembler.sub(esp, 0x0C)?;
            assembler.push(eax)?;
            assembler.mov(ecx, entry.handler.as_usize() as u32)?;
            assembler.call(ecx)?;

            match entry.completion {
                Completion::FallThrough => assembler.jmp(done)?,
                Completion::Return { value, stack_bytes } => {
                    assembler.mov(esp, ebx)?;
                    assembler.popad()?;
                    assembler.popfd()?;
                    assembler.mov(eax, value as u32)?;
                    match stack_bytes {
                        0 => assembler.ret()?,
                        bytes => assembler.ret_1(i32::from(bytes))?,
                    }
                },
            }

            if !last {
                assembler.set_label(&mut next)?;
            }
        }

        assembler.set_label(&mut done)?;
        assembler.mov(esp, ebx)?;
        assembler.popad()?;
        assembler.popfd()?;

        for instruction in self.relocated.iter() {
            assembler.add_instruction(*instruction)?;
        }
        assembler.jmp(self.resume.as_u64())?;

        Ok(assembler.assemble(at.as_u64())?)
    }
}

fn gpr64(register: SlotRegister) -> iced_x86::code_asm::AsmRegister64 {
    use iced_x86::code_asm::*;

    match register {
        SlotRegister::Rax => rax,
        SlotRegister::Rcx => rcx,
        SlotRegister::Rdx => rdx,
        SlotRegister::Rbx => rbx,
        SlotRegister::Rsi => rsi,
        SlotRegister::Rdi => rdi,
        SlotRegister::R8 => r8,
        SlotRegister::R9 => r9,
    }
}

fn gpr32(register: SlotRegister) -> Result<iced_x86::code_asm::AsmRegister32, HookError> {
    use iced_x86::code_asm::*;

    match register {
        SlotRegister::Rax => Ok(eax),
        SlotRegister::Rcx => Ok(ecx),
        SlotRegister::Rdx => Ok(edx),
        SlotRegister::Rbx => Ok(ebx),
        SlotRegister::Rsi => Ok(esi),
        SlotRegister::Rdi => Ok(edi),
        SlotRegister::R8 | SlotRegister::R9 => Err(HookError::Assembly(format!(
            "{:?} does not exist in 32-bit code",
            register,
        ))),
    }
}

/// Decodes the bytes about to be overwritten. The patch has to end on an instruction
/// boundary since the instructions get replayed from the trampoline.
pub fn decode_patch_region(
    architecture: Architecture,
    address: Address,
    bytes: &[u8],
) -> Result<Vec<Instruction>, HookError> {
    let mut decoder = Decoder::with_ip(
        architecture.bitness(),
        bytes,
        address.as_u64(),
        DecoderOptions::NONE,
    );

    let mut instructions = vec![];
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::PatchSplitsInstruction { address, width: bytes.len() });
        }

        instructions.push(instruction);
    }

    Ok(instructions)
}

/// Jump from `from` to `to` padded with NOPs to `width` bytes.
pub fn redirect(
    architecture: Architecture,
    from: Address,
    to: Address,
    width: usize,
) -> Result<Vec<u8>, HookError> {
    let mut bytes = match architecture {
        // Displacements wrap around the 4 GiB address space.
        Architecture::X86 => {
            let next = (from.as_usize() as u32).wrapping_add(REL32_JUMP_LENGTH as u32);
            jmp_rel32((to.as_usize() as u32).wrapping_sub(next) as i32)
        },
        Architecture::X86_64 => match from.rel32_to(&to, REL32_JUMP_LENGTH) {
            Some(displacement) => jmp_rel32(displacement),
            None => jmp_absolute(to),
        },
    };

    if bytes.len() > width {
        return Err(HookError::PatchWidthInsufficient {
            address: from,
            width,
            required: bytes.len(),
        });
    }

    bytes.resize(width, NOP);
    Ok(bytes)
}

fn jmp_rel32(displacement: i32) -> Vec<u8> {
    let mut bytes = vec![0xE9];
    bytes.extend_from_slice(&displacement.to_le_bytes());
    bytes
}

// jmp qword ptr [rip+0] followed by the target
fn jmp_absolute(to: Address) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
    bytes.extend_from_slice(&to.as_u64().to_le_bytes());
    bytes
}
