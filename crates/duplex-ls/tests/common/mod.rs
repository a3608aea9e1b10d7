#![allow(dead_code)]

//! Raw-wire helpers for driving one side of a connection by hand.

use std::io::{BufRead, Write};

use serde_json::Value;

pub fn runtime() -> tokio::runtime::Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Writes one framed payload.
pub fn write_raw(w: &mut impl Write, text: &str) {
    write!(w, "Content-Length: {}\r\n\r\n{text}", text.len()).unwrap();
    w.flush().unwrap();
}

/// Reads one framed payload and parses it.
pub fn read_raw(r: &mut impl BufRead) -> Value {
    let mut size = None;
    loop {
        let mut line = String::new();
        r.read_line(&mut line).unwrap();
        assert!(line.ends_with("\r\n"), "malformed header: {line:?}");
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length: ") {
            size = Some(value.parse().unwrap());
        }
    }
    let mut buf = vec![0u8; size.expect("no Content-Length header")];
    std::io::Read::read_exact(r, &mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}
