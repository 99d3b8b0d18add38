pub fn supported() -> bool {
    false
}

pub fn disassemble(_name: &str, _code: &[u8], _comments: &[(u32, String)], _safepoints: &[u32]) -> String {
    unreachable!();
}
