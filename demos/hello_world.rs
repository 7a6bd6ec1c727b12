use worker_web::{AppResult, Application, BindTarget, Environ, ResponseBody, Server, StartResponse};

struct HelloWorld;

impl Application for HelloWorld {
    fn call(&self, _: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult {
        start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
        Ok(ResponseBody::from("Hello, world!"))
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind(BindTarget::new("127.0.0.1", 8080))
        .application(HelloWorld)
        .build()
        .unwrap()
        .start(false)
        .unwrap();
}
