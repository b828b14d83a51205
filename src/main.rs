use rawhttp::{
    async_trait, default_headers, Handler, HeaderTable, Request, ResponseWriter, Server,
    ServerConfig, StatusCode,
};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tracing::{info, warn};

const OK_HTML: &str = "<html>
  <head>
    <title>200 OK</title>
  </head>
  <body>
    <h1>Success!</h1>
    <p>Your request was an absolute banger.</p>
  </body>
</html>";

const BAD_REQUEST_HTML: &str = "<html>
  <head>
    <title>400 Bad Request</title>
  </head>
  <body>
    <h1>Bad Request</h1>
    <p>Your request honestly kinda sucked.</p>
  </body>
</html>";

const INTERNAL_ERROR_HTML: &str = "<html>
  <head>
    <title>500 Internal Server Error</title>
  </head>
  <body>
    <h1>Internal Server Error</h1>
    <p>Okay, you know what? This one is on me.</p>
  </body>
</html>";

const MAX_CHUNKS: usize = 1000;

struct Routes;

#[async_trait]
impl Handler for Routes {
    async fn call(&self, writer: &mut ResponseWriter<TcpStream>, request: &Request) {
        if let Err(e) = route(writer, request).await {
            warn!(error = ?e, "error writing response.");
        }
    }
}

async fn route(writer: &mut ResponseWriter<TcpStream>, request: &Request) -> anyhow::Result<()> {
    match (request.method(), request.target()) {
        ("GET", "/") | ("GET", "/index.html") => {
            writer
                .respond(StatusCode::OK, "text/html", OK_HTML.as_bytes())
                .await?;
        }
        (_, "/yourproblem") => {
            writer
                .respond(StatusCode::BAD_REQUEST, "text/html", BAD_REQUEST_HTML.as_bytes())
                .await?;
        }
        (_, "/myproblem") => {
            writer
                .respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/html",
                    INTERNAL_ERROR_HTML.as_bytes(),
                )
                .await?;
        }
        ("GET", path) if path.starts_with("/chunked/") => {
            stream_chunks(writer, &path["/chunked/".len()..]).await?;
        }
        (_, path) => {
            let body = format!("Error 404: no resource with path {} found", path);
            writer
                .respond(StatusCode::NOT_FOUND, "text/plain", body.as_bytes())
                .await?;
        }
    }
    info!("successfully sent response");
    Ok(())
}

/// Streams `count` chunks, then reports their digest and length as trailers.
async fn stream_chunks(writer: &mut ResponseWriter<TcpStream>, count: &str) -> anyhow::Result<()> {
    let count = match count.parse::<usize>() {
        Ok(n) if n <= MAX_CHUNKS => n,
        _ => {
            let body = format!("expected a chunk count up to {}\n", MAX_CHUNKS);
            writer
                .respond(StatusCode::BAD_REQUEST, "text/plain", body.as_bytes())
                .await?;
            return Ok(());
        }
    };

    let mut headers = default_headers(0);
    headers.remove("Content-Length");
    headers.set("Transfer-Encoding", "chunked");
    headers.set("Trailer", "X-Content-Sha1, X-Content-Length");
    writer.write_status_line(StatusCode::OK).await?;
    writer.write_headers(&headers).await?;

    let mut hasher = Sha1::new();
    let mut length = 0;
    for i in 1..=count {
        let chunk = format!("chunk {} of {}\n", i, count);
        hasher.update(chunk.as_bytes());
        length += chunk.len();
        writer.write_chunked_body(chunk.as_bytes()).await?;
    }
    writer.write_chunked_body_done().await?;

    let mut trailers = HeaderTable::new();
    trailers.set("X-Content-Sha1", &format!("{:x}", hasher.finalize()));
    trailers.set("X-Content-Length", &length.to_string());
    writer.write_trailers(&trailers).await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::new()?;
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();
    info!("starting server.");

    let server = Server::serve_with_config(&config, Routes).await?;
    info!(port = server.local_addr().port(), "server started.");

    shutdown_signal().await?;
    info!("shutdown signal received.");
    server.shutdown().await?;
    info!("server gracefully stopped.");
    Ok(())
}
