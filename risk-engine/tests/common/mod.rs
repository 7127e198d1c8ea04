//! Shared fixtures for the integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use fraud_risk_engine::{
    DevicePayload, EngineConfig, GeoLocation, IpReputation, ManualClock, MemoryDecisionLog,
    PaymentMethod, RiskAggregator, StaticGeoResolver, StaticIpIntelligence, TransactionEvent,
};
use rust_decimal::Decimal;
use std::net::IpAddr;
use std::sync::Arc;

pub const HOME_IP: &str = "200.160.2.3";
pub const LISBON_IP: &str = "85.240.1.9";
pub const TOR_EXIT_IP: &str = "185.220.101.4";

pub struct TestEngine {
    pub engine: RiskAggregator,
    pub clock: Arc<ManualClock>,
    pub resolver: Arc<StaticGeoResolver>,
    pub log: Arc<MemoryDecisionLog>,
}

/// Monday 2026-06-01, 14:00 in São Paulo
pub fn monday_afternoon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 17, 0, 0).unwrap()
}

pub fn ip(text: &str) -> IpAddr {
    text.parse().unwrap()
}

pub fn resolver() -> StaticGeoResolver {
    let resolver = StaticGeoResolver::new();
    resolver.insert(
        ip(HOME_IP),
        GeoLocation::country("BR")
            .with_place("SP", "Sao Paulo")
            .with_coordinates(-23.55, -46.63),
    );
    resolver.insert(
        ip(LISBON_IP),
        GeoLocation::country("PT")
            .with_place("Lisboa", "Lisbon")
            .with_coordinates(38.72, -9.14),
    );
    resolver
}

pub fn intelligence() -> StaticIpIntelligence {
    let intelligence = StaticIpIntelligence::new();
    intelligence.insert(
        ip(TOR_EXIT_IP),
        IpReputation {
            vpn_score: 0.0,
            tor_score: 100.0,
            abuse_score: 60.0,
        },
    );
    intelligence
}

pub fn engine_with(config: EngineConfig, resolver: StaticGeoResolver) -> TestEngine {
    let clock = Arc::new(ManualClock::new(monday_afternoon()));
    let resolver = Arc::new(resolver);
    let log = Arc::new(MemoryDecisionLog::new());
    let engine = RiskAggregator::builder(config, resolver.clone(), Arc::new(intelligence()))
        .clock(clock.clone())
        .decision_log(log.clone())
        .build()
        .unwrap();
    TestEngine {
        engine,
        clock,
        resolver,
        log,
    }
}

pub fn engine() -> TestEngine {
    engine_with(EngineConfig::default(), resolver())
}

pub fn home_device() -> DevicePayload {
    DevicePayload {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) Safari/605.1.15".to_string(),
        screen_resolution: Some("2560x1600".to_string()),
        timezone: Some("America/Sao_Paulo".to_string()),
        language: Some("pt-BR".to_string()),
        platform: Some("MacIntel".to_string()),
        canvas_hash: Some("9f1c2e".to_string()),
        webgl_hash: Some("apple-m2".to_string()),
        plugins: vec!["pdf".to_string()],
        webdriver: false,
    }
}

pub fn travel_device() -> DevicePayload {
    DevicePayload {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/126.0".to_string(),
        screen_resolution: Some("1366x768".to_string()),
        timezone: Some("Europe/Lisbon".to_string()),
        language: Some("en-US".to_string()),
        platform: Some("Win32".to_string()),
        canvas_hash: Some("77ab01".to_string()),
        webgl_hash: Some("intel-uhd".to_string()),
        plugins: Vec::new(),
        webdriver: false,
    }
}

/// Debit card purchase from home, in BRL
pub fn home_purchase(customer: &str, amount: i64, at: DateTime<Utc>) -> TransactionEvent {
    TransactionEvent::new(
        customer,
        Decimal::from(amount),
        "BRL",
        PaymentMethod::DebitCard,
        at,
    )
    .with_ip(ip(HOME_IP))
    .with_device(home_device())
    .with_locale("pt-BR", -180)
}
