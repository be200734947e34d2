use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Formats `data` in the classic offset / hex / ASCII layout, offsets starting at `addr`.
pub fn hexdump(addr: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:08x} ", addr + (i * BYTES_PER_LINE) as u64);
        for column in 0..BYTES_PER_LINE {
            if column % 8 == 0 {
                out.push(' ');
            }
            match line.get(column) {
                Some(byte) => {
                    let _ = write!(out, "{:02x} ", byte);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str(" |");
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

#[test]
fn full_and_partial_lines() {
    let data: Vec<u8> = (0x41..0x41 + 20).collect();
    let dump = hexdump(0x1000, &data);
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "00001000  41 42 43 44 45 46 47 48  49 4a 4b 4c 4d 4e 4f 50  |ABCDEFGHIJKLMNOP|"
    );
    assert!(lines[1].starts_with("00001010  51 52 53 54 "));
    assert!(lines[1].ends_with("|QRST|"));
}

#[test]
fn non_printable_bytes() {
    let dump = hexdump(0, &[0x00, 0x7f, b' ']);
    assert!(dump.ends_with("|.. |\n"));
}
