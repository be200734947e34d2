use std::{
    net::SocketAddr,
    sync::{Mutex, mpsc},
    time::Duration,
};

use osd_client::{Builder, Context, ModuleIndex, directory::reg, transport::DaemonTransport};
use osd_tests::{MEMORY_BASE, MEMORY_MODULE, SYSTEM_ID, TRACE_MODULE, pattern, start_daemon};

fn connect(addr: SocketAddr) -> Context {
    let ctx = Builder::new()
        .rpc_timeout(Duration::from_secs(5))
        .build(DaemonTransport::new(addr).unwrap());
    ctx.connect().unwrap();
    ctx
}

async fn wait_for_clients(server: &osd_sim::server::Server, count: usize) {
    for _ in 0..200 {
        if server.client_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} clients, got {}", count, server.client_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enumerate_over_daemon() {
    let (_server, addr, _storage) = start_daemon(64).await;
    let identifier = tokio::task::spawn_blocking(move || {
        let ctx = connect(addr);
        ctx.system_info().unwrap().identifier()
    })
    .await
    .unwrap();
    assert_eq!(identifier, SYSTEM_ID);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_over_daemon() {
    let (server, addr, _storage) = start_daemon(64).await;
    tokio::task::spawn_blocking(move || {
        let ctx = connect(addr);
        ctx.reset(true).unwrap();
    })
    .await
    .unwrap();
    let sysrst = server.with_system(|system| system.read_register(1, reg::SCM_SYSRST));
    assert_eq!(sysrst, Some(0x2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_over_daemon() {
    let (_server, addr, storage) = start_daemon(64).await;
    let data = pattern(5000);
    let expected = data.clone();
    let read = tokio::task::spawn_blocking(move || {
        let ctx = connect(addr);
        let module = ModuleIndex::new(MEMORY_MODULE);
        ctx.memory_write(module, MEMORY_BASE + 0x11, &data).unwrap();
        ctx.memory_read(module, MEMORY_BASE + 0x11, data.len()).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(read, expected);
    assert_eq!(&storage.lock().unwrap()[0x11..0x11 + 5000], &expected[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traces_reach_every_host() {
    let (server, addr, _storage) = start_daemon(64).await;
    let (tx, rx) = mpsc::channel();
    let hosts = tokio::task::spawn_blocking(move || {
        (0..2)
            .map(|host| {
                let ctx = connect(addr);
                let tx = Mutex::new(tx.clone());
                ctx.register_trace_handler(ModuleIndex::new(TRACE_MODULE), move |p| {
                    let _ = tx.lock().unwrap().send((host, p.payload().to_vec()));
                })
                .unwrap();
                ctx
            })
            .collect::<Vec<_>>()
    })
    .await
    .unwrap();
    wait_for_clients(&server, 2).await;

    server.emit_trace(TRACE_MODULE, vec![0x1234]);
    let mut seen = tokio::task::spawn_blocking(move || {
        vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ]
    })
    .await
    .unwrap();
    seen.sort();
    assert_eq!(seen, vec![(0, vec![0x1234]), (1, vec![0x1234])]);

    tokio::task::spawn_blocking(move || drop(hosts)).await.unwrap();
    wait_for_clients(&server, 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_hosts_keep_their_reads_apart() {
    let (_server, addr, storage) = start_daemon(64).await;
    for host in 0..3usize {
        storage.lock().unwrap()[host * 0x1000..host * 0x1000 + 0x800].fill(host as u8 + 1);
    }
    let workers: Vec<_> = (0..3u64)
        .map(|host| {
            tokio::task::spawn_blocking(move || {
                let ctx = connect(addr);
                let module = ModuleIndex::new(MEMORY_MODULE);
                let expected = vec![host as u8 + 1; 0x800];
                for _ in 0..5 {
                    let read = ctx
                        .memory_read(module, MEMORY_BASE + host * 0x1000, expected.len())
                        .unwrap();
                    assert_eq!(read, expected);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }
}
