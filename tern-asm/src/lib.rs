use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub mod thumb2;

pub use thumb2::AssemblerThumb2 as Assembler;

use std::convert::TryInto;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Label(usize);

impl Label {
    pub fn index(self) -> usize {
        self.0
    }
}

struct AssemblerBuffer {
    code: Vec<u8>,
    position: usize,
    labels: Vec<Option<u32>>,
}

impl AssemblerBuffer {
    fn new() -> AssemblerBuffer {
        AssemblerBuffer {
            code: Vec::new(),
            position: 0,
            labels: Vec::new(),
        }
    }

    fn create_label(&mut self) -> Label {
        self.labels.push(None);

        Label(self.labels.len() - 1)
    }

    fn create_and_bind_label(&mut self) -> Label {
        self.labels.push(Some(self.position().try_into().unwrap()));
        Label(self.labels.len() - 1)
    }

    fn bind_label(&mut self, lbl: Label) {
        let Label(idx) = lbl;
        assert!(self.labels[idx].is_none(), "label bound twice");
        self.labels[idx] = Some(self.position().try_into().unwrap());
    }

    fn offset(&self, lbl: Label) -> Option<u32> {
        let Label(idx) = lbl;
        self.labels[idx]
    }

    fn position(&self) -> usize {
        self.position
    }

    fn set_position(&mut self, pos: usize) {
        self.position = pos;
    }

    fn set_position_end(&mut self) {
        self.position = self.code.len();
    }

    fn emit_u8(&mut self, value: u8) {
        if self.position == self.code.len() {
            self.code.push(value);
        } else {
            self.code[self.position] = value;
        }
        self.position += 1;
    }

    fn emit_u16(&mut self, value: u16) {
        if self.position == self.code.len() {
            self.code.write_u16::<LittleEndian>(value).unwrap()
        } else {
            LittleEndian::write_u16(&mut self.code[self.position..], value);
        }
        self.position += 2;
    }

    fn emit_u32(&mut self, value: u32) {
        if self.position == self.code.len() {
            self.code.write_u32::<LittleEndian>(value).unwrap()
        } else {
            LittleEndian::write_u32(&mut self.code[self.position..], value);
        }
        self.position += 4;
    }

    fn emit_u64(&mut self, value: u64) {
        if self.position == self.code.len() {
            self.code.write_u64::<LittleEndian>(value).unwrap()
        } else {
            LittleEndian::write_u64(&mut self.code[self.position..], value);
        }
        self.position += 8;
    }

    fn read_u16(&self, pos: usize) -> u16 {
        LittleEndian::read_u16(&self.code[pos..])
    }

    fn read_u32(&self, pos: usize) -> u32 {
        LittleEndian::read_u32(&self.code[pos..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_overwrite() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u32(0x11223344);
        buf.emit_u16(0x5566);
        buf.set_position(2);
        buf.emit_u16(0xaabb);
        buf.set_position_end();
        assert_eq!(buf.code, vec![0x44, 0x33, 0xbb, 0xaa, 0x66, 0x55]);
        assert_eq!(buf.read_u16(4), 0x5566);
        assert_eq!(buf.read_u32(0), 0xaabb3344);
    }

    #[test]
    #[should_panic]
    fn test_bind_label_twice() {
        let mut buf = AssemblerBuffer::new();
        let lbl = buf.create_label();
        buf.bind_label(lbl);
        buf.bind_label(lbl);
    }
}
