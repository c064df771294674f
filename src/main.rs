//! `evap-check <config.json>`: connects every configured device, prints what
//! each reports and closes again.

use anyhow::{Context, Result};

use evap_link_lib::{init_logging, Station, StationConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info);

    let path = std::env::args()
        .nth(1)
        .context("usage: evap-check <station-config.json>")?;
    let config = StationConfig::from_json_file(&path)
        .with_context(|| format!("loading {}", path))?;

    let station = Station::new(&config).map_err(anyhow::Error::msg)?;

    let failures = station.connect_all().await;
    for (device, err) in &failures {
        log::warn!("{} unavailable: {}", device, err);
    }

    if !failures.contains_key("stm100") {
        match station.stm_version().await {
            Ok(v) => println!("STM-100 version: {}", v),
            Err(e) => println!("STM-100 version: {}", e),
        }
        match station.thickness().await {
            Ok(t) => println!("STM-100 thickness: {} A", t),
            Err(e) => println!("STM-100 thickness: {}", e),
        }
        match station.rate().await {
            Ok(r) => println!("STM-100 rate: {} A/s", r),
            Err(e) => println!("STM-100 rate: {}", e),
        }
    }

    if !failures.contains_key("acs2000") {
        match station.acs_version().await {
            Ok(v) => println!("ACS2000 version: {}", v),
            Err(e) => println!("ACS2000 version: {}", e),
        }
        for channel in [1u8, 2] {
            match station.pressure(channel).await {
                Ok(p) => println!("ACS2000 channel {} pressure: {:e}", channel, p),
                Err(e) => println!("ACS2000 channel {} pressure: {}", channel, e),
            }
        }
    }

    if !failures.contains_key("plc") {
        match station.read_status().await {
            Ok(status) => {
                let mut names: Vec<_> = status.into_iter().collect();
                names.sort();
                for (name, on) in names {
                    println!("{:<16} {}", name, if on { "ON" } else { "off" });
                }
            }
            Err(e) => println!("PLC status: {}", e),
        }
    }

    let snapshot = station.status().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    station.close_all().await;
    Ok(())
}
