use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mmtp_core::{ClientConfig, MaritimeId, PositionTime};
use mmtp_tokio::{ClientParams, connect};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Serialize, Deserialize)]
struct Weather {
    wind_speed: f64,
    wave_height: f64,
}

impl mmtp_core::BroadcastPayload for Weather {
    const CHANNEL: &'static str = "weather";
}

#[derive(Serialize, Deserialize)]
struct GetName;

impl mmtp_core::ServiceMessage for GetName {
    type Reply = String;
    const CHANNEL: &'static str = "hello.GetName";
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("MMTP_LOG")
                .from_env_lossy(),
        )
        .init();

    let config = ClientConfig::new(MaritimeId::mmsi(219000606), "localhost:43234");
    let client = connect(ClientParams::new(
        config,
        Box::new(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()?
                .as_millis() as i64;
            PositionTime::new(56.07, 12.61, now).ok()
        }),
    ))
    .await?;
    info!("connected as {}", client.local_id());

    let registration = client.service_register::<GetName, _>(|header, _msg, ctx| {
        info!("name asked by {}", header.src);
        ctx.complete("MS Ask".to_owned());
    })?;
    registration
        .await_registered(Duration::from_secs(5))
        .await?;
    info!("service registered on {}", registration.channel());

    let subscription = client.broadcast_listen::<Weather, _>(|header, weather| {
        info!(
            "weather from {}: wind {} m/s, waves {} m",
            header.src, weather.wind_speed, weather.wave_height
        );
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        let future = client.broadcast(&Weather {
            wind_speed: 12.4,
            wave_height: 1.7,
        })?;
        future.received_on_server().await?;
        info!(
            "weather sent; {} broadcasts heard so far",
            subscription.message_count()
        );
    }
}
