use std::fmt::Write;

use capstone::prelude::*;

pub fn supported() -> bool {
    true
}

/// Thumb-2 listing of `code`, annotated with code generator comments and
/// the offsets that carry a stack map.
pub fn disassemble(name: &str, code: &[u8], comments: &[(u32, String)], safepoints: &[u32]) -> String {
    let engine = Capstone::new()
        .arm()
        .mode(arch::arm::ArchMode::Thumb)
        .build()
        .expect("cannot create capstone engine");

    let mut w = String::new();
    writeln!(&mut w, "method {} ({} bytes)", name, code.len()).unwrap();

    let instrs = match engine.disasm_all(code, 0) {
        Ok(instrs) => instrs,
        Err(err) => {
            writeln!(&mut w, "  <disassembly failed: {}>", err).unwrap();
            return w;
        }
    };

    for instr in instrs.iter() {
        let addr = instr.address() as u32;

        for (_, comment) in comments.iter().filter(|(offset, _)| *offset == addr) {
            writeln!(&mut w, "\t\t  // {}", comment).unwrap();
        }

        writeln!(
            &mut w,
            "  {:#06x}: {}\t\t{}{}",
            addr,
            instr.mnemonic().unwrap_or("?"),
            instr.op_str().unwrap_or(""),
            if safepoints.contains(&(addr + instr.bytes().len() as u32)) {
                "\t; safepoint"
            } else {
                ""
            }
        )
        .unwrap();
    }

    w
}
