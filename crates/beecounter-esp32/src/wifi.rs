//! WiFi station connection for ESP32.
//!
//! [`connect_wifi`] does the blocking bring-up at boot. Afterwards the
//! connection is handed to a [`WifiLink`], which the connectivity watchdog
//! polls; reconnects from there are non-blocking.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use beecounter_core::network::NetworkLink;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::peripheral,
    nvs::EspDefaultNvsPartition,
    sys::{esp_wifi_sta_get_ap_info, wifi_ap_record_t, ESP_OK},
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};
use log::{info, warn};

/// How long boot waits for the first association.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to a WiFi network.
///
/// 1. Scans for the target network to learn its channel
/// 2. Connects with the provided credentials
/// 3. Waits for a DHCP lease
///
/// Returns the driver (keep it alive for the connection to persist) and the
/// assigned IP address.
pub fn connect_wifi(
    ssid: &str,
    password: &str,
    modem: impl peripheral::Peripheral<P = esp_idf_svc::hal::modem::Modem> + 'static,
    sysloop: EspSystemEventLoop,
    nvs: Option<EspDefaultNvsPartition>,
) -> Result<(Box<EspWifi<'static>>, String)> {
    if ssid.is_empty() {
        bail!("WiFi SSID cannot be empty");
    }

    let auth_method = if password.is_empty() {
        info!("WiFi password is empty, using open network");
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    let mut esp_wifi = EspWifi::new(modem, sysloop.clone(), nvs)?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sysloop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
    wifi.start()?;

    info!("Scanning for WiFi networks...");
    let channel = wifi
        .scan()?
        .into_iter()
        .find(|ap| ap.ssid == ssid)
        .map(|ap| {
            info!("Found '{}' on channel {}", ssid, ap.channel);
            ap.channel
        });
    if channel.is_none() {
        info!("Network '{}' not found in scan, will try anyway", ssid);
    }

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("SSID too long (max 32 chars)"))?,
        password: password
            .try_into()
            .map_err(|_| anyhow!("Password too long (max 64 chars)"))?,
        channel,
        auth_method,
        ..Default::default()
    }))?;

    info!("Connecting to '{}'...", ssid);
    let started = Instant::now();
    loop {
        match wifi.connect() {
            Ok(()) => break,
            Err(e) if started.elapsed() < CONNECT_TIMEOUT => {
                warn!("Connect attempt failed: {}, retrying", e);
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!("Waiting for DHCP lease...");
    wifi.wait_netif_up()?;

    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    info!("WiFi connected!");
    info!("  IP address: {}", ip_info.ip);
    info!("  Gateway:    {}", ip_info.subnet.gateway);
    info!("  Netmask:    {}", ip_info.subnet.mask);

    Ok((Box::new(esp_wifi), ip_info.ip.to_string()))
}

/// Connected station, as seen by the connectivity watchdog.
pub struct WifiLink {
    wifi: Mutex<Box<EspWifi<'static>>>,
}

impl WifiLink {
    pub fn new(wifi: Box<EspWifi<'static>>) -> Self {
        Self {
            wifi: Mutex::new(wifi),
        }
    }
}

impl NetworkLink for WifiLink {
    fn is_connected(&self) -> bool {
        self.wifi
            .lock()
            .map(|w| w.is_connected().unwrap_or(false))
            .unwrap_or(false)
    }

    fn begin_reconnect(&self) -> Result<(), String> {
        let mut wifi = self.wifi.lock().map_err(|_| "WiFi driver poisoned".to_string())?;
        // Non-blocking: EspWifi::connect only starts the association.
        wifi.disconnect().ok();
        wifi.connect().map_err(|e| e.to_string())
    }

    fn rssi(&self) -> Option<i32> {
        let mut record = wifi_ap_record_t::default();
        // SAFETY: writes into the caller-provided record.
        let rc = unsafe { esp_wifi_sta_get_ap_info(&mut record) };
        (rc == ESP_OK as i32).then_some(record.rssi as i32)
    }
}
