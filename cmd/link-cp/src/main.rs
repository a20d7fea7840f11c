//! Copy a file with linked read/write pairs: each chunk's write is chained
//! behind its read, so both enter the kernel together and execute in order.
//!
//! Usage: link-cp <src> <dst>

use ouro::*;
use std::os::unix::io::AsRawFd;

const CHUNK: usize = 64 * 1024;

fn main() {
    let mut args = std::env::args().skip(1);
    let (src, dst) = match (args.next(), args.next()) {
        (Some(s), Some(d)) => (s, d),
        _ => {
            eprintln!("usage: link-cp <src> <dst>");
            std::process::exit(2);
        }
    };

    let src_file = std::fs::File::open(&src).expect("cannot open source");
    let dst_file = std::fs::File::create(&dst).expect("cannot create destination");
    let size = src_file.metadata().expect("stat failed").len();
    let (src_fd, dst_fd) = (src_file.as_raw_fd(), dst_file.as_raw_fd());

    let rt = Runtime::new(RuntimeOptions::default()).expect("runtime setup failed");
    let copied = block_on(&rt, async move {
        let mut buf = vec![0u8; CHUNK];
        let ptr = buf.as_mut_ptr();
        let mut offset = 0u64;

        // Full chunks go through linked pairs; regular-file reads below EOF
        // always fill the buffer, so the linked write length is exact.
        while offset + CHUNK as u64 <= size {
            let (r, w) = unsafe {
                linked((
                    async_read(src_fd, std::slice::from_raw_parts_mut(ptr, CHUNK), offset),
                    async_write(dst_fd, std::slice::from_raw_parts(ptr, CHUNK), offset),
                ))
            }
            .await;
            assert_eq!(r, CHUNK as i32, "short read at offset {}", offset);
            assert_eq!(w, CHUNK as i32, "short write at offset {}", offset);
            offset += CHUNK as u64;
        }

        // Tail: sequential read then write.
        if offset < size {
            let tail = (size - offset) as usize;
            let r = async_read(src_fd, &mut buf[..tail], offset).await;
            assert_eq!(r, tail as i32, "short tail read");
            let mut written = 0usize;
            while written < tail {
                let w = async_write(dst_fd, &buf[written..tail], offset + written as u64).await;
                assert!(w > 0, "tail write failed: {}", w);
                written += w as usize;
            }
            offset += tail as u64;
        }
        offset
    });

    println!("copied {} bytes from {} to {}", copied, src, dst);
}
