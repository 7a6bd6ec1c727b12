//! Serves HTTPS on 8443 with the certificates under `tests/data`.
//!
//! ```text
//! curl --cacert tests/data/ca.pem https://localhost:8443/
//! curl --cacert tests/data/ca.pem --cert tests/data/client.pem \
//!      --key tests/data/client.key https://localhost:8443/
//! ```

use worker_web::{app_fn, BindTarget, ResponseBody, Server};

fn main() {
    tracing_subscriber::fmt::init();

    let data = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data");
    let target = BindTarget::tls(
        "127.0.0.1",
        8443,
        format!("{data}/server.key"),
        format!("{data}/server.pem"),
    )
    .client_ca(format!("{data}/ca.pem"));

    let app = app_fn(|env, start| {
        let greeting = match env.peer_certificate() {
            Some(cert) => format!("Hello, certified client ({} byte certificate)!\n", cert.len()),
            None => "Hello, anonymous client!\n".to_string(),
        };

        start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
        Ok(ResponseBody::from(greeting))
    });

    Server::builder()
        .bind(target)
        .application(app)
        .build()
        .unwrap()
        .start(false)
        .unwrap();
}
