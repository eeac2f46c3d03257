use std::env;
use std::sync::Mutex;

use actix_web::{web, App, HttpServer};
use brainrun::http::brain::{server, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: brain_server <address> <port>");
        std::process::exit(2);
    }

    let address: String = args[1].clone();
    let port: u16 = args[2]
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let brain_state = web::Data::new(Mutex::new(AppState::demo()));

    HttpServer::new(move || {
        App::new()
            .app_data(brain_state.clone())
            .configure(server::configure)
    })
    .bind((address, port))?
    .run()
    .await
}
