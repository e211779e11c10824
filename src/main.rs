use modelgate::app;
use modelgate::bootkit::{BootKit, LifeCycleHook};
use modelgate::filters::Services;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,modelgate=debug")),
        )
        .json()
        .init();

    let mut boot = BootKit::new();
    boot.add(|lifecycle| async move {
        let runtime = app::RuntimeConfig::from_env();
        let state = app::load_state_with_runtime(runtime.clone(), Services::default(), &lifecycle)
            .await
            .map_err(|err| err.message.clone())?;
        let router = app::build_app(state.clone());

        let addr: std::net::SocketAddr = runtime
            .listen
            .parse()
            .map_err(|err: std::net::AddrParseError| err.to_string())?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| err.to_string())?;
        tracing::info!("listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        lifecycle.append(
            LifeCycleHook::on_stop({
                let state = state.clone();
                move || async move {
                    state.drain.drain().await;
                    let _ = shutdown_tx.send(());
                    Ok(())
                }
            })
            .with_start(move || async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .map_err(|err| err.to_string())
            }),
        );

        Ok(())
    });

    boot.start().await;
}
