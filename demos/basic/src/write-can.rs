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

/// Parse a candump style frame token: ID#HEXDATA (e.g. 123#DEADBEEF).
fn parse_frame(token: &str) -> Result<(CanId, Vec<u8>), String> {
    let (id_hex, data_hex) = token
        .split_once('#')
        .ok_or_else(|| format!("expected ID#DATA, got {token}"))?;

    let value = u32::from_str_radix(id_hex, 16).map_err(|e| format!("bad id {id_hex}: {e}"))?;
    let canid = if id_hex.len() > 3 {
        CanId::new_ext(value)
    } else {
        CanId::new_std(value)
    };

    if data_hex.len() % 2 != 0 {
        return Err(format!("odd data length in {token}"));
    }
    let mut data = Vec::with_capacity(data_hex.len() / 2);
    for idx in (0..data_hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&data_hex[idx..idx + 2], 16)
            .map_err(|e| format!("bad data byte in {token}: {e}"))?;
        data.push(byte);
    }

    Ok((canid, data))
}

fn main() -> Result<(), String> {
    // Initialize logging backend for the `log` facade (idempotent).
    let env = Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();

    let mut args = std::env::args().skip(1);
    let candev = args.next().ok_or("missing can iface (e.g., vcan0)")?;

    let sockfd = match SockCanRaw::open(candev.as_str()) {
        Err(error) => return Err(format!("fail opening candev {error}")),
        Ok(value) => value,
    };

    let mut count = 0;
    for token in args {
        let (canid, data) = parse_frame(&token)?;
        sockfd.send(&canid, &data).map_err(|e| e.to_string())?;
        log::info!("Sent frame id:{:#04x} data:{:?}", canid.get_value(), data);
        count += 1;
    }

    if count == 0 {
        return Err("no frame given (e.g., can-write vcan0 123#DEADBEEF)".to_string());
    }

    log::info!("done, {} frame(s) sent on {}", count, candev);
    Ok(())
}
