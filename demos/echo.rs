use std::io::Read;
use worker_web::{AppResult, Application, BindTarget, Environ, ResponseBody, Server, StartResponse};

struct Echo;

impl Application for Echo {
    fn call(&self, env: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult {
        let mut body = Vec::new();
        env.body().read_to_end(&mut body)?;

        let content_type = env
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();

        start.start_response("200 OK", vec![("Content-Type".into(), content_type)])?;
        Ok(ResponseBody::from(body))
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind(BindTarget::new("127.0.0.1", 8080))
        .application(Echo)
        .build()
        .unwrap()
        .start(false)
        .unwrap();
}
