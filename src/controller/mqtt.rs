//! Controller tags over an MQTT tag gateway.
//!
//! The gateway mirrors each controller tag `T` on topic `<prefix>/<T>`, where
//! `prefix` defaults to `plc/<slot>`. Reads return the latest value seen on
//! the tag's topic; writes publish retained values back to the same topic.
//!
//! A background thread drives the MQTT event loop. Once that loop reports a
//! connection error, every later operation fails with `Connectivity`: the
//! monitor treats a lost controller link as fatal.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{parse_bool_payload, Controller, ControllerError, TagResult};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Clone, Debug)]
pub struct MqttControllerConfig {
    /// Gateway address: `host`, `host:port`, `mqtt://host:port` or `tcp://host:port`.
    pub address: String,
    /// Controller slot; selects the default topic prefix.
    pub slot: u32,
    /// Overrides the `plc/<slot>` topic prefix.
    pub topic_prefix: Option<String>,
    pub client_id: String,
    /// Upper bound on one tag round trip.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

impl MqttControllerConfig {
    pub fn prefix(&self) -> String {
        match &self.topic_prefix {
            Some(prefix) => prefix.trim_end_matches('/').to_string(),
            None => format!("plc/{}", self.slot),
        }
    }
}

impl Default for MqttControllerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_MQTT_PORT),
            slot: 0,
            topic_prefix: None,
            client_id: "fault_monitor".to_string(),
            read_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse a gateway address. Supported forms: `host`, `host:port`,
/// `[ipv6]:port`, and either with an `mqtt://` or `tcp://` scheme.
pub fn parse_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported controller scheme: {}", other)),
        }
        remainder = rest;
    }
    if remainder.is_empty() {
        return Err(anyhow!("controller address must not be empty"));
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid controller address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None => DEFAULT_MQTT_PORT,
        };
        return Ok(MqttEndpoint {
            host: host.to_string(),
            port,
        });
    }

    match remainder.rsplit_once(':') {
        Some((host, port)) => Ok(MqttEndpoint {
            host: host.to_string(),
            port: parse_port(port, addr)?,
        }),
        None => Ok(MqttEndpoint {
            host: remainder.to_string(),
            port: DEFAULT_MQTT_PORT,
        }),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("invalid controller port in {}", addr))
}

#[derive(Default)]
struct TagCache {
    connected: bool,
    link_error: Option<String>,
    values: HashMap<String, Vec<u8>>,
}

struct SharedCache {
    cache: Mutex<TagCache>,
    changed: Condvar,
}

impl SharedCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(TagCache::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TagCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn store(&self, tag: &str, payload: Vec<u8>) {
        self.lock().values.insert(tag.to_string(), payload);
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for a value on `tag` and parse it as a boolean.
    fn wait_for_bool(&self, tag: &str, timeout: Duration) -> TagResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut cache = self.lock();
        loop {
            if let Some(err) = &cache.link_error {
                return Err(ControllerError::Connectivity(err.clone()));
            }
            if let Some(payload) = cache.values.get(tag) {
                return parse_bool_payload(payload).ok_or_else(|| {
                    ControllerError::tag_io(
                        tag,
                        format!("payload is not a boolean: {}", String::from_utf8_lossy(payload)),
                    )
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControllerError::Timeout {
                    tag: tag.to_string(),
                    after: timeout,
                });
            }
            cache = self
                .changed
                .wait_timeout(cache, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }
}

/// Connected controller handle. Dropping it disconnects.
pub struct MqttController {
    client: Client,
    prefix: String,
    read_timeout: Duration,
    shared: Arc<SharedCache>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttController {
    /// Connect to the gateway and subscribe to every tag under the prefix.
    pub fn connect(config: &MqttControllerConfig) -> TagResult<Self> {
        let endpoint = parse_endpoint(&config.address)
            .map_err(|e| ControllerError::Connectivity(format!("{:#}", e)))?;
        let prefix = config.prefix();

        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        let (client, connection) = Client::new(options, 16);

        client
            .subscribe(format!("{}/#", prefix), QoS::AtLeastOnce)
            .map_err(|e| ControllerError::Connectivity(e.to_string()))?;

        let shared = Arc::new(SharedCache::new());
        let event_loop = {
            let shared = Arc::clone(&shared);
            let prefix = prefix.clone();
            std::thread::Builder::new()
                .name("controller-mqtt".to_string())
                .spawn(move || drive_event_loop(connection, &prefix, &shared))
                .map_err(|e| ControllerError::Connectivity(e.to_string()))?
        };

        let controller = Self {
            client,
            prefix,
            read_timeout: config.read_timeout,
            shared,
            event_loop: Some(event_loop),
        };
        controller.wait_connected(config.connect_timeout)?;
        log::info!(
            "controller gateway {}:{} connected (topics {}/#)",
            endpoint.host,
            endpoint.port,
            controller.prefix
        );
        Ok(controller)
    }

    fn topic(&self, tag: &str) -> String {
        format!("{}/{}", self.prefix, tag)
    }

    fn wait_connected(&self, timeout: Duration) -> TagResult<()> {
        let deadline = Instant::now() + timeout;
        let mut cache = self.shared.lock();
        loop {
            if let Some(err) = &cache.link_error {
                return Err(ControllerError::Connectivity(err.clone()));
            }
            if cache.connected {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControllerError::Connectivity(format!(
                    "no CONNACK within {:?}",
                    timeout
                )));
            }
            cache = self
                .shared
                .changed
                .wait_timeout(cache, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }

    fn publish(&mut self, tag: &str, payload: Vec<u8>) -> TagResult<()> {
        if let Some(err) = &self.shared.lock().link_error {
            return Err(ControllerError::Connectivity(err.clone()));
        }
        self.client
            .publish(self.topic(tag), QoS::AtLeastOnce, true, payload)
            .map_err(|e| ControllerError::tag_io(tag, e.to_string()))
    }
}

impl Controller for MqttController {
    fn read_bool(&mut self, tag: &str) -> TagResult<bool> {
        self.shared.wait_for_bool(tag, self.read_timeout)
    }

    fn write_bool(&mut self, tag: &str, value: bool) -> TagResult<()> {
        let payload = if value { b"1".to_vec() } else { b"0".to_vec() };
        self.publish(tag, payload)
    }

    fn write_string(&mut self, tag: &str, value: &str) -> TagResult<()> {
        self.publish(tag, value.as_bytes().to_vec())
    }
}

impl Drop for MqttController {
    fn drop(&mut self) {
        if let Err(e) = self.client.disconnect() {
            log::debug!("controller disconnect: {}", e);
        }
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
    }
}

fn drive_event_loop(mut connection: Connection, prefix: &str, shared: &SharedCache) {
    let topic_prefix = format!("{}/", prefix);
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                shared.lock().connected = true;
                shared.changed.notify_all();
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic);
                let Some(tag) = topic.strip_prefix(&topic_prefix) else {
                    continue;
                };
                shared.store(tag, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                record_link_error(shared, "gateway closed the session".to_string());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                record_link_error(shared, e.to_string());
                break;
            }
        }
    }
}

fn record_link_error(shared: &SharedCache, error: String) {
    log::debug!("controller event loop stopped: {}", error);
    shared.lock().link_error = Some(error);
    shared.changed.notify_all();
}
