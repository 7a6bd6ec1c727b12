use std::{thread, time::Duration};
use worker_web::{app_fn, limits::ServerLimits, BindTarget, ResponseBody, Server};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info,worker_web=debug")
        .init();

    let app = app_fn(|env, start| {
        let count: u32 = env
            .query()
            .strip_prefix("n=")
            .and_then(|n| n.parse().ok())
            .unwrap_or(5);

        start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;

        // Every item is one chunk on the wire.
        Ok(ResponseBody::stream((1..=count).map(|i| {
            thread::sleep(Duration::from_millis(200));
            format!("tick {i}\n")
        })))
    });

    Server::builder()
        .bind(BindTarget::new("127.0.0.1", 8080))
        .application(app)
        .server_limits(ServerLimits {
            min_threads: 2,
            max_threads: 32,
            ..ServerLimits::default()
        })
        .build()
        .unwrap()
        .start(false)
        .unwrap();
}
