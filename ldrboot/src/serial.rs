// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! COM1 logger. Port I/O only, so it keeps working after ExitBootServices
//! and across the CR3 switch.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

static PORT: Mutex<Option<SerialPort>> = Mutex::new(None);
static LOGGER: SerialLogger = SerialLogger;

pub fn init(level: LevelFilter) {
    let mut port = unsafe { SerialPort::new(COM1) };
    port.init();
    *PORT.lock() = Some(port);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

pub fn write_fmt(args: fmt::Arguments) {
    if let Some(ref mut port) = *PORT.lock() {
        let _ = port.write_fmt(args);
    }
}

/// For the panic handler: whoever held the port is not coming back.
pub fn emergency_write(args: fmt::Arguments) {
    unsafe { PORT.force_unlock() };
    write_fmt(args);
}

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            write_fmt(format_args!(
                "[{:<5}] {}: {}\r\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}
