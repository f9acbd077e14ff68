use serterm::transform::{bit_reverse, map_receive, map_transmit, Forward, MapFlags, Render};

#[test]
fn identity_without_map_flags() {
    let flags = MapFlags::empty();
    for byte in 0..=255u8 {
        assert_eq!(map_transmit(byte, flags), Forward::Byte(byte));
        assert_eq!(map_receive(byte, flags), (byte, Render::Byte(byte)));
    }
}

#[test]
fn transmit_then_receive_echo_reproduces_semantics() {
    // A device that echoes what it receives: the rendered result must
    // follow the documented per-flag behavior for every byte.
    let subsets = [
        MapFlags::empty(),
        MapFlags::ODELBS,
        MapFlags::OCRNL,
        MapFlags::ODELBS | MapFlags::OCRNL,
        MapFlags::ONULBRK,
        MapFlags::INLCRNL,
        MapFlags::IFFESCC,
        MapFlags::ODELBS | MapFlags::INLCRNL | MapFlags::IFFESCC,
    ];

    for &flags in &subsets {
        for byte in 0..=255u8 {
            let wire = match map_transmit(byte, flags) {
                Forward::Byte(wire) => wire,
                Forward::CrLfPair => {
                    assert!(flags.contains(MapFlags::ONLCRNL));
                    continue;
                }
                Forward::Break => {
                    assert_eq!(byte, 0);
                    assert!(flags.contains(MapFlags::ONULBRK));
                    continue;
                }
            };

            // Transmit-side expectations.
            if byte == 127 && flags.contains(MapFlags::ODELBS) {
                assert_eq!(wire, b'\x08');
            } else if byte == b'\r' && flags.contains(MapFlags::OCRNL) {
                assert_eq!(wire, b'\n');
            } else {
                assert_eq!(wire, byte);
            }

            // Receive-side expectations on the echoed byte.
            let (mapped, render) = map_receive(wire, flags);
            assert_eq!(mapped, wire);
            if wire == b'\n' && flags.contains(MapFlags::INLCRNL) {
                assert_eq!(render, Render::CrLf);
            } else if wire == 0x0c && flags.contains(MapFlags::IFFESCC) {
                assert_eq!(render, Render::ClearScreen);
            } else {
                assert_eq!(render, Render::Byte(wire));
            }
        }
    }
}

#[test]
fn onlcrnl_expands_both_line_endings() {
    let flags = MapFlags::ONLCRNL;
    assert_eq!(map_transmit(b'\n', flags), Forward::CrLfPair);
    assert_eq!(map_transmit(b'\r', flags), Forward::CrLfPair);
    assert_eq!(map_transmit(b'a', flags), Forward::Byte(b'a'));
}

#[test]
fn msb2lsb_applied_twice_is_identity() {
    for byte in 0..=255u8 {
        assert_eq!(bit_reverse(bit_reverse(byte)), byte);
    }
}

#[test]
fn msb2lsb_reverses_before_other_receive_maps() {
    let flags = MapFlags::MSB2LSB;
    for byte in 0..=255u8 {
        let (mapped, render) = map_receive(byte, flags);
        assert_eq!(mapped, bit_reverse(byte));
        assert_eq!(render, Render::Byte(bit_reverse(byte)));
    }

    // Newline normalisation and FF-as-clear are suppressed while the
    // bit order is reversed.
    let flags = MapFlags::MSB2LSB | MapFlags::INLCRNL | MapFlags::IFFESCC;
    let (_, render) = map_receive(bit_reverse(b'\n'), flags);
    assert_eq!(render, Render::Byte(b'\n'));
    let (_, render) = map_receive(bit_reverse(0x0c), flags);
    assert_eq!(render, Render::Byte(0x0c));
}
