#![allow(dead_code)]

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{Datelike, Duration, NaiveDate};
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use zip::write::SimpleFileOptions;

const DAY_MS: i64 = 86_400_000;

/// A Binance-style headerless kline CSV with one daily candle per date.
pub fn daily_kline_csv(days: &[NaiveDate], base_price: f64) -> String {
    days.iter()
        .enumerate()
        .map(|(i, day)| {
            let open_time = day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
            let close_time = open_time + DAY_MS - 1;
            let price = base_price + (i as f64 * 0.7).sin() * 25.0 + i as f64;
            format!(
                "{open_time},{price:.2},{:.2},{:.2},{:.2},1234.5,{close_time},2500000.0,9876,600.25,1250000.0,0\n",
                price + 12.0,
                price - 12.0,
                price + 3.0
            )
        })
        .collect()
}

pub fn month_days(year: i32, month: u32) -> Vec<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (0..31)
        .map(|d| first + Duration::days(d))
        .take_while(|d| d.month() == month)
        .collect()
}

pub fn zip_archive(inner_name: &str, csv: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(inner_name, SimpleFileOptions::default()).unwrap();
    writer.write_all(csv.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Serves `routes` (path, body) on an ephemeral port; every other path is a 404.
pub async fn serve_files(routes: Vec<(String, Vec<u8>)>) -> SocketAddr {
    let mut app = Router::new();
    for (path, body) in routes {
        app = app.route(
            &path,
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
    }
    serve(app).await
}

/// Fake inference API answering every token with `status` and `body`.
pub async fn serve_inference(status: StatusCode, body: &'static str) -> SocketAddr {
    let app = Router::new().route("/inference/:token", get(move || async move { (status, body) }));
    serve(app).await
}

/// Accepts every request and never answers it.
pub async fn serve_hanging() -> SocketAddr {
    let app = Router::new().fallback(|| std::future::pending::<()>());
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
