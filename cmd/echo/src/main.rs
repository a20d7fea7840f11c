//! TCP echo server: multishot accept spawns one detached coroutine per
//! connection.
//!
//! Usage: echo [addr]   (default 127.0.0.1:7000)

use ouro::*;
use std::os::unix::io::{AsRawFd, RawFd};

async fn serve_connection(fd: RawFd) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = async_recv(fd, &mut buf, 0).await;
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let m = async_send(fd, &buf[sent..n as usize], 0).await;
            if m <= 0 {
                async_close(fd).await;
                return;
            }
            sent += m as usize;
        }
    }
    async_close(fd).await;
}

fn main() {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());
    let listener = std::net::TcpListener::bind(&addr).expect("bind failed");
    let listen_fd = listener.as_raw_fd();
    println!("echo server listening on {}", addr);

    let rt = Runtime::new(RuntimeOptions::new().sq_size(256)).expect("runtime setup failed");
    if !rt.features().multishot_accept {
        eprintln!("kernel lacks multishot accept (needs 5.19+)");
        std::process::exit(1);
    }

    block_on(&rt, async move {
        let res = async_multishot_accept(listen_fd, will_spawn(serve_connection)).await;
        eprintln!("accept loop terminated: {}", res);
    });
}
