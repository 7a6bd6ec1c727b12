use std::io::Read;
use worker_web::{AppResult, Application, BindTarget, Environ, ResponseBody, Server, StartResponse};

struct Inspector;

impl Application for Inspector {
    fn call(&self, env: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult {
        let headers = env
            .headers()
            .iter()
            .map(|(name, value)| format!("{name:?}: {value:?}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut body = String::new();
        env.body().read_to_string(&mut body)?;

        let result = format!(
            r#"{{"method": "{}", "path": {:?}, "query": {:?}, "version": "{}", "remote": "{}:{}", "scheme": "{}", "headers": {{{headers}}}, "body": {body:?}}}"#,
            env.method(),
            env.path(),
            env.query(),
            env.version(),
            env.remote_addr(),
            env.remote_port(),
            env.url_scheme(),
        );

        start.start_response("200 OK", vec![("Content-Type".into(), "application/json".into())])?;
        Ok(ResponseBody::from(result))
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind(BindTarget::new("127.0.0.1", 8080))
        .application(Inspector)
        .build()
        .unwrap()
        .start(false)
        .unwrap();
}
