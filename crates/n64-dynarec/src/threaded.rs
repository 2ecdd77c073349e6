//! Threaded-code backend: blocks are vectors of pre-decoded ops walked by
//! a match loop, with no host code generation.

use crate::block::CompiledBlock;
use crate::op::{decode, Op};
use crate::{BlockCompiler, CompileError, CompileRequest, InstructionSource};

/// Blocks never cross a 4 KiB page, so one translation covers them.
const PAGE_MASK: u32 = 0xFFF;

#[derive(Debug, Default)]
pub struct ThreadedCompiler {
    compiled: u64,
}

impl ThreadedCompiler {
    pub fn blocks_built(&self) -> u64 {
        self.compiled
    }
}

impl BlockCompiler for ThreadedCompiler {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn compile(
        &mut self,
        request: &CompileRequest,
        source: &mut dyn InstructionSource,
    ) -> Result<CompiledBlock, CompileError> {
        let max = request.max_instructions.max(1) as usize;
        let mut ops: Vec<Op> = Vec::with_capacity(max.min(64));
        let mut shadow = Vec::with_capacity(max.min(64));
        let mut phys = request.start_phys;
        let mut jump_target = None;
        let mut has_control_flow = false;

        while ops.len() < max {
            if !ops.is_empty() && phys & PAGE_MASK == 0 {
                break;
            }
            // A fault past the first instruction just ends the block there;
            // the interpreter raises it if execution actually gets that far.
            let raw = match source.read_u32(phys) {
                Ok(raw) => raw,
                Err(_) if !ops.is_empty() => break,
                Err(err) => return Err(err),
            };
            let op = decode(raw);

            if op.is_control_flow() {
                let slot_phys = phys.wrapping_add(4);
                if slot_phys & PAGE_MASK == 0 || ops.len() + 2 > max {
                    // The branch and its slot must stay together.
                    if ops.is_empty() {
                        return Err(CompileError::SplitDelaySlot { phys_addr: phys });
                    }
                    break;
                }
                let slot_raw = match source.read_u32(slot_phys) {
                    Ok(raw) => raw,
                    Err(_) if !ops.is_empty() => break,
                    Err(err) => return Err(err),
                };
                let slot = decode(slot_raw);
                if slot.is_control_flow() || slot.ends_block() {
                    if ops.is_empty() {
                        return Err(CompileError::ControlFlowInDelaySlot {
                            phys_addr: slot_phys,
                        });
                    }
                    break;
                }
                let branch_vaddr = request
                    .start_vaddr
                    .wrapping_add(u64::from(phys.wrapping_sub(request.start_phys)));
                jump_target = op.static_target(branch_vaddr);
                has_control_flow = true;
                ops.extend([op, slot]);
                shadow.extend([raw, slot_raw]);
                phys = slot_phys.wrapping_add(4);
                break;
            }

            ops.push(op);
            shadow.push(raw);
            phys = phys.wrapping_add(4);
            if op.ends_block() {
                break;
            }
        }

        self.compiled += 1;
        log::trace!(
            "compiled block {:#010X}..{:#010X} ({} ops)",
            request.start_phys,
            phys,
            ops.len()
        );
        Ok(CompiledBlock {
            start_phys: request.start_phys,
            end_phys: phys,
            start_vaddr: request.start_vaddr,
            instruction_count: ops.len() as u32,
            has_control_flow,
            jump_target,
            shadow,
            ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSource;

    fn request(start_phys: u32, max_instructions: u32) -> CompileRequest {
        CompileRequest {
            start_phys,
            start_vaddr: 0xFFFF_FFFF_8000_0000 | u64::from(start_phys),
            max_instructions,
        }
    }

    #[test]
    fn block_ends_after_delay_slot() {
        let start = 0x1000u32;
        let mut src = TestSource::with_words(&[
            (start, 0x2408_0001),      // addiu t0, r0, 1
            (start + 4, 0x1109_0003),  // beq t0, t1, +3
            (start + 8, 0x2409_0002),  // addiu t1, r0, 2 (slot)
            (start + 12, 0x2400_0001), // not reached
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 3);
        assert_eq!(block.end_phys, start + 12);
        assert!(block.has_control_flow);
        assert_eq!(block.jump_target, Some(0xFFFF_FFFF_8000_1014));
        assert_eq!(block.shadow, vec![0x2408_0001, 0x1109_0003, 0x2409_0002]);
    }

    #[test]
    fn block_ends_after_cop0_write() {
        let start = 0x2000u32;
        let mut src = TestSource::with_words(&[
            (start, 0x2408_0001),     // addiu t0, r0, 1
            (start + 4, 0x4088_6000), // mtc0 t0, Status
            (start + 8, 0x0000_0000),
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 2);
        assert!(!block.has_control_flow);
        assert!(block.ops[1].ends_block());
    }

    #[test]
    fn branch_without_room_for_slot_is_left_out() {
        let start = 0x3000u32;
        let mut src = TestSource::with_words(&[
            (start, 0x0000_0000),
            (start + 4, 0x1000_FFFF), // b .
            (start + 8, 0x0000_0000),
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 2), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 1);
        assert!(!block.has_control_flow);
    }

    #[test]
    fn block_stops_at_page_boundary() {
        let start = 0x0FF8u32;
        let mut src = TestSource::with_words(&[
            (start, 0x0000_0000),
            (start + 4, 0x0000_0000),
            (start + 8, 0x0000_0000),
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 2);
        assert_eq!(block.end_phys, 0x1000);

        // A branch in the last word of a page cannot take its slot along.
        let mut src = TestSource::with_words(&[(0x1FFC, 0x1000_FFFF), (0x2000, 0)]);
        let err = ThreadedCompiler::default()
            .compile(&request(0x1FFC, 16), &mut src)
            .unwrap_err();
        assert_eq!(err, CompileError::SplitDelaySlot { phys_addr: 0x1FFC });
    }

    #[test]
    fn unreadable_word_ends_block_early() {
        let start = 0x5000u32;
        let mut src = TestSource::with_words(&[
            (start, 0x2408_0001),     // addiu t0, r0, 1
            (start + 4, 0x2409_0002), // addiu t1, r0, 2
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 2);
        assert_eq!(block.end_phys, start + 8);

        // The branch is dropped when its slot cannot be read.
        let mut src = TestSource::with_words(&[
            (start, 0x2408_0001),
            (start + 4, 0x1000_0002), // b +2
        ]);
        let block = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap();
        assert_eq!(block.instruction_count, 1);
        assert!(!block.has_control_flow);

        let err = ThreadedCompiler::default()
            .compile(&request(start + 0x100, 16), &mut src)
            .unwrap_err();
        assert_eq!(err, CompileError::MemoryRead { phys_addr: start + 0x100 });
    }

    #[test]
    fn branch_in_delay_slot_is_rejected() {
        let start = 0x4000u32;
        let mut src = TestSource::with_words(&[
            (start, 0x1000_0002),     // b +2
            (start + 4, 0x0800_0000), // j 0 (in the slot)
        ]);
        let err = ThreadedCompiler::default()
            .compile(&request(start, 16), &mut src)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::ControlFlowInDelaySlot {
                phys_addr: start + 4
            }
        );
    }
}
