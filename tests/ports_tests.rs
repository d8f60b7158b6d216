use portprobe::ports::{parse_port_spec, parse_ports, validate_ports};
use portprobe::ScanError;
use std::time::{Duration, Instant};

#[test]
fn parse_singles_ranges_and_duplicates() {
    let ports = parse_ports("22,80,80,1000-1002");
    assert_eq!(ports, vec![22, 80, 1000, 1001, 1002]);
}

#[test]
fn bad_tokens_skipped_out_of_range_kept_for_validation() {
    let ports = parse_ports("abc,22,99999");
    assert_eq!(ports, vec![22, 99999]);

    match validate_ports(&ports) {
        Err(ScanError::InvalidPorts { ports }) => assert_eq!(ports, vec![99999]),
        other => panic!("expected InvalidPorts, got {other:?}"),
    }
}

#[test]
fn combined_error_message_lists_every_offender() {
    let err = parse_port_spec("65536, 80, 70000-70001").unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("65536") && msg.contains("70000") && msg.contains("70001"));
    assert!(!msg.contains(" 80"));
}

#[test]
fn whitespace_and_overlapping_ranges() {
    let ports = parse_port_spec(" 5 - 7 , 6-9, 5 ").expect("parse ok");
    assert_eq!(ports, vec![5, 6, 7, 8, 9]);
}

#[test]
fn full_u32_range_is_rejected_quickly() {
    let start = Instant::now();
    match parse_port_spec("0-4294967295") {
        Err(ScanError::InvalidPorts { ports }) => assert_eq!(ports, vec![65536, 4_294_967_295]),
        other => panic!("expected InvalidPorts, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn oversized_number_is_an_offender_not_an_empty_spec() {
    match parse_port_spec("99999999999") {
        Err(ScanError::InvalidPorts { ports }) => assert_eq!(ports, vec![99_999_999_999]),
        other => panic!("expected InvalidPorts, got {other:?}"),
    }
}
