/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 */
extern crate rawcan;
use env_logger::Env;
use rawcan::prelude::*;

fn main() -> Result<(), String> {
    // Initialize logging backend for the `log` facade (idempotent).
    let env = Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();

    let candev = std::env::args().nth(1).unwrap_or_else(|| "vcan0".to_string());

    let sockfd = match SockCanRaw::open(candev.as_str()) {
        Err(error) => return Err(format!("fail opening candev {error}")),
        Ok(value) => value,
    };

    if let Err(error) = SockCanFilter::new(2)
        .add_whitelist(0x257, FilterMask::SFF_MASK)
        .add_whitelist(0x118, FilterMask::ERR_FLAG | FilterMask::SFF_MASK)
        .apply(&sockfd)
    {
        return Err(format!("raw-filter fail filter Error:{error}"));
    }

    log::info!("Waiting for Raw CAN package on {}", candev);
    loop {
        match sockfd.recv() {
            Err(error) => return Err(format!("fail reading candev: {error}")),
            Ok(CanRecv::Frame(frame)) => log::info!(
                "Received frame id:{:#04x} len:{} data:{:?}",
                frame.get_id().get_value(),
                frame.get_len(),
                frame.get_data()
            ),
            Ok(CanRecv::Invalid(canid)) => log::warn!(
                "Discarded invalid frame id:{:#04x} error:{}",
                canid.get_value(),
                canid.is_error()
            ),
            Ok(CanRecv::NoData) => log::debug!("Got no data"),
        }
    }
}
