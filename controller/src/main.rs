mod app;
mod calendar;
mod clock;
mod hardware;
mod history;
mod rules;
mod server;
mod thermostat;
mod valve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
