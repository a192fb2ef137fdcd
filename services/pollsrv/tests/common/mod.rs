//! Shared fixtures: simulated meters wired into a scheduler

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use meter_protocols::bytes::ByteOrder;
use meter_protocols::simulator::MeterSimulator;
use meter_protocols::{
    parse_schema_csv, DeviceClient, DeviceEndpoint, DeviceId, DeviceStatus, ModbusConnector,
    ProtocolKind, ReadFunction, RegisterMap, TransformTable, ValueType,
};
use pollsrv::{
    CollectingSink, CounterReconciler, FleetScheduler, ManualClock, MemoryRegistry, MeterStore,
    ReconcileSettings, SchedulerSettings,
};

pub const SCHEMA: &str = "\
address,size,type,byte_order,word_order,function,attribute,group,active
0,2,float32,,,1,voltage_l1,instant,1
2,2,float32,,,1,voltage_l2,instant,1
4,2,float32,,,1,frequency,instant,1
100,2,uint32,,,2,active_energy_import,cumulative,1
102,2,uint32,,,2,active_energy_export,cumulative,1
";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// Simulator serving the test schema with the given readings
pub async fn meter(voltage: f64, import_kwh: f64) -> MeterSimulator {
    let sim = MeterSimulator::new();
    for (address, value) in [(0, voltage), (2, voltage - 1.5), (4, 50.0)] {
        sim.set_value(
            ReadFunction::Holding,
            address,
            value,
            ValueType::Float32,
            ByteOrder::BigEndian,
        )
        .await;
    }
    set_counters(&sim, import_kwh, 0.0).await;
    sim
}

pub async fn set_counters(sim: &MeterSimulator, import_kwh: f64, export_kwh: f64) {
    for (address, value) in [(100, import_kwh), (102, export_kwh)] {
        sim.set_value(
            ReadFunction::Input,
            address,
            value,
            ValueType::Uint32,
            ByteOrder::BigEndian,
        )
        .await;
    }
}

/// An address nothing listens on
pub fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn endpoint(id: DeviceId, addr: SocketAddr) -> DeviceEndpoint {
    let rows = parse_schema_csv(SCHEMA.as_bytes()).unwrap();
    let map = RegisterMap::compile(&rows, 125).unwrap();
    DeviceEndpoint {
        id,
        name: format!("meter-{id}"),
        host: addr.ip().to_string(),
        port: addr.port(),
        protocol: ProtocolKind::Tcp,
        unit_id: 1,
        model: "test".to_string(),
        instant_blocks: Arc::new(map.instant),
        cumulative_blocks: Arc::new(map.cumulative),
        transforms: Arc::new(TransformTable::new()),
        status: DeviceStatus::Active,
        notes: None,
    }
}

pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<dyn MeterStore>,
    pub events: Arc<CollectingSink>,
    pub clock: Arc<ManualClock>,
    pub scheduler: FleetScheduler,
}

pub struct HarnessOptions {
    pub read_timeout: Duration,
    pub settings: SchedulerSettings,
    pub reconcile: ReconcileSettings,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            settings: SchedulerSettings {
                concurrency: 4,
                cycle_deadline: Duration::from_secs(10),
            },
            reconcile: ReconcileSettings::default(),
        }
    }
}

pub fn harness(
    endpoints: Vec<DeviceEndpoint>,
    store: Arc<dyn MeterStore>,
    options: HarnessOptions,
) -> Harness {
    let registry = Arc::new(MemoryRegistry::new(endpoints));
    let events = Arc::new(CollectingSink::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let connector = ModbusConnector::new(Duration::from_millis(500), options.read_timeout);
    let reconciler = Arc::new(CounterReconciler::new(store.clone(), options.reconcile));

    let scheduler = FleetScheduler::new(
        registry.clone(),
        DeviceClient::new(Arc::new(connector)),
        store.clone(),
        reconciler,
        options.settings,
    )
    .with_events(events.clone())
    .with_clock(clock.clone());

    Harness {
        registry,
        store,
        events,
        clock,
        scheduler,
    }
}

pub async fn wait_for_closed(sim: &MeterSimulator) -> bool {
    for _ in 0..100 {
        if sim.open_connections() == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
