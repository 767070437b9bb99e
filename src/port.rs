use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::time::Duration;

use crate::cli::SerialOpts;

/// EZ-Serial text mode runs 8N1. The short read timeout is what lets reader
/// threads poll their stop flag.
pub fn open_port(opts: &SerialOpts) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(Duration::from_millis(100))
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))
}

/// Independent read and write halves over the same device, so the reader
/// thread can block without holding up command writes.
pub fn open_duplex(opts: &SerialOpts) -> Result<(Box<dyn SerialPort>, Box<dyn SerialPort>)> {
    let reader = open_port(opts)?;
    let writer = reader
        .try_clone()
        .with_context(|| format!("cloning {} for writes", opts.dev))?;
    Ok((reader, writer))
}
