use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use rand::{seq::SliceRandom, Rng};

use crate::kvservice::client::Clerk;
use crate::kvservice::config::Config;
use crate::proto::kvpb::{CmdKind, PutAppendArgs};

/// Generously allows elections to complete in one second.
const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

// get/put/append that keep counts
fn get(cfg: &Config, ck: &Clerk, key: &str) -> String {
    let v = ck.get(key.to_owned());
    cfg.op();
    v
}

fn put(cfg: &Config, ck: &Clerk, key: &str, value: &str) {
    ck.put(key.to_owned(), value.to_owned());
    cfg.op();
}

fn append(cfg: &Config, ck: &Clerk, key: &str, value: &str) {
    ck.append(key.to_owned(), value.to_owned());
    cfg.op();
}

fn check(cfg: &Config, ck: &Clerk, key: &str, value: &str) {
    let v = get(cfg, ck, key);
    if v != value {
        panic!("get({:?}): expected:\n{:?}\nreceived:\n{:?}", key, value, v);
    }
}

// check that for a specific client all known appends are present in a value,
// and in order
fn check_clnt_appends(clnt: usize, v: &str, count: usize) {
    let mut lastoff = None;
    for j in 0..count {
        let wanted = format!("x {} {} y", clnt, j);
        if let Some(off) = v.find(&wanted) {
            let off1 = v.rfind(&wanted).unwrap();
            assert_eq!(off1, off, "duplicate element {:?} in append result", wanted);

            if let Some(lastoff) = lastoff {
                assert!(
                    off > lastoff,
                    "wrong order for element {:?} in append result",
                    wanted
                );
            }
            lastoff = Some(off);
        } else {
            panic!(
                "{:?} missing element {:?} in append result {:?}",
                clnt, wanted, v
            )
        }
    }
}

// One or more clients submitting append/get operations for a while. After
// the period is over, the test checks that all appended values are present
// and in order for each client's key. If unreliable is set, RPCs may fail.
// If crash is set, the servers restart after every period, so persistence
// must work. If partitions is set, the network is repartitioned under the
// clients' feet.
fn generic_test(nclients: usize, unreliable: bool, crash: bool, partitions: bool) {
    let mut title = "Test: ".to_owned();
    if unreliable {
        title += "unreliable net, ";
    }
    if crash {
        title += "restarts, ";
    }
    if partitions {
        title += "partitions, ";
    }
    if nclients > 1 {
        title += "many clients";
    } else {
        title += "one client";
    }

    const NSERVERS: usize = 5;
    let cfg = Arc::new(Config::new(NSERVERS, unreliable, None));

    cfg.begin(&title);

    let ck = cfg.make_client(&cfg.all());

    for round in 0..3 {
        debug!("round {}", round);
        let done_clients = Arc::new(AtomicBool::new(false));
        let done_partitioner = Arc::new(AtomicBool::new(false));

        let mut client_handles = Vec::with_capacity(nclients);
        for cli in 0..nclients {
            let cfg = cfg.clone();
            let done = done_clients.clone();
            client_handles.push(thread::spawn(move || -> usize {
                let myck = cfg.make_client(&cfg.all());
                let key = format!("{}", cli);
                let mut last = String::new();
                let mut j = 0;
                let mut rng = rand::thread_rng();
                put(&cfg, &myck, &key, &last);
                while !done.load(Ordering::Relaxed) {
                    if rng.gen::<u32>() % 1000 < 500 {
                        let nv = format!("x {} {} y", cli, j);
                        debug!("{}: client new append {}", cli, nv);
                        append(&cfg, &myck, &key, &nv);
                        last += &nv;
                        j += 1;
                    } else {
                        debug!("{}: client new get {:?}", cli, key);
                        let v = get(&cfg, &myck, &key);
                        if v != last {
                            panic!(
                                "get wrong value, key {:?}, wanted:\n{:?}\n, got\n{:?}",
                                key, last, v
                            );
                        }
                    }
                }
                cfg.delete_client(&myck);
                j
            }));
        }

        let partitioner_handle = if partitions {
            // let the clients get some operations through uninterrupted
            thread::sleep(Duration::from_secs(1));
            let cfg = cfg.clone();
            let done = done_partitioner.clone();
            Some(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while !done.load(Ordering::Relaxed) {
                    let mut all: Vec<usize> = (0..NSERVERS).collect();
                    all.shuffle(&mut rng);
                    let offset = rng.gen_range(0, NSERVERS);
                    cfg.partition(&all[..offset], &all[offset..]);
                    let ms = ELECTION_TIMEOUT.as_millis() as u64 + rng.gen::<u64>() % 200;
                    thread::sleep(Duration::from_millis(ms));
                }
            }))
        } else {
            None
        };

        thread::sleep(Duration::from_secs(5));

        // tell clients and partitioner to quit
        done_clients.store(true, Ordering::Relaxed);
        done_partitioner.store(true, Ordering::Relaxed);

        if let Some(handle) = partitioner_handle {
            handle.join().unwrap();
        }

        if partitions {
            debug!("healing the network");
            // reconnect so a request parked in a minority can finish; wait
            // for the cluster to settle on a new term
            cfg.connect_all();
            thread::sleep(ELECTION_TIMEOUT);
        }

        if crash {
            debug!("shutdown servers");
            for i in 0..NSERVERS {
                cfg.shutdown_server(i);
            }
            // shutdown isn't instantaneous, wait a little before restarting
            thread::sleep(ELECTION_TIMEOUT);
            debug!("restart servers");
            for i in 0..NSERVERS {
                cfg.start_server(i);
            }
            cfg.connect_all();
        }

        for (cli, handle) in client_handles.into_iter().enumerate() {
            debug!("waiting for client {}", cli);
            let j = handle.join().unwrap();
            if j < 10 {
                warn!(
                    "client {} managed only {} appends in 5 seconds",
                    cli, j
                );
            }
            let key = format!("{}", cli);
            let v = get(&cfg, &ck, &key);
            check_clnt_appends(cli, &v, j);
        }
    }

    cfg.end();
}

#[test]
fn test_basic() {
    let cfg = Config::new(3, false, None);
    cfg.begin("Test: basic put/append/get");

    let ck = cfg.make_client(&cfg.all());

    // a missing key reads as the empty string
    assert_eq!(get(&cfg, &ck, "missing"), "");

    put(&cfg, &ck, "a", "1");
    check(&cfg, &ck, "a", "1");

    append(&cfg, &ck, "a", "23");
    check(&cfg, &ck, "a", "123");

    // append to a missing key acts like put
    append(&cfg, &ck, "b", "9");
    check(&cfg, &ck, "b", "9");

    // appending nothing changes nothing
    append(&cfg, &ck, "a", "");
    check(&cfg, &ck, "a", "123");

    put(&cfg, &ck, "a", "overwritten");
    check(&cfg, &ck, "a", "overwritten");

    // a second clerk sees the same data
    let ck2 = cfg.make_client(&cfg.all());
    check(&cfg, &ck2, "a", "overwritten");

    cfg.end();
}

#[test]
fn test_leader_failover() {
    let cfg = Config::new(5, false, None);
    cfg.begin("Test: service survives leader failure");

    let ck = cfg.make_client(&cfg.all());

    put(&cfg, &ck, "x", "10");
    check(&cfg, &ck, "x", "10");

    // find the leader and take it down
    let leader = loop {
        match cfg.leader() {
            Ok(leader) => break leader,
            Err(_) => thread::sleep(Duration::from_millis(100)),
        }
    };
    cfg.shutdown_server(leader);

    // the remaining four serve reads and writes
    check(&cfg, &ck, "x", "10");
    put(&cfg, &ck, "x", "11");
    check(&cfg, &ck, "x", "11");

    // the old leader comes back as a follower
    cfg.start_server(leader);
    cfg.connect_all();
    check(&cfg, &ck, "x", "11");

    cfg.end();
}

#[test]
fn test_resend_is_no_op() {
    let cfg = Config::new(3, false, None);
    cfg.begin("Test: re-sending a write with the same sequence number is a no-op");

    let ck = cfg.make_client(&cfg.all());
    put(&cfg, &ck, "k", "");

    // hand-rolled request, so the "retry" can reuse the sequence number the
    // way a clerk whose reply was lost would
    let args = PutAppendArgs {
        clerk_id: 7777,
        seq_id: 0,
        key: "k".to_owned(),
        value: "A".to_owned(),
        op: CmdKind::Append as i32,
    };
    let mut delivered = 0;
    while delivered < 3 {
        for server in &ck.servers {
            if let Ok(reply) = block_on(server.put_append(&args)) {
                if !reply.wrong_leader {
                    delivered += 1;
                    if delivered >= 3 {
                        break;
                    }
                }
            }
        }
    }

    // exactly one "A" despite three accepted deliveries
    check(&cfg, &ck, "k", "A");

    cfg.end();
}

#[test]
fn test_one_partition() {
    let cfg = Arc::new(Config::new(5, false, None));

    cfg.begin("Test: progress in majority");

    let ck = cfg.make_client(&cfg.all());
    put(&cfg, &ck, "1", "13");

    let (p1, p2) = cfg.make_partition();
    cfg.partition(&p1, &p2);

    let ckp1 = cfg.make_client(&p1); // connected to p1, the majority
    let ckp2a = cfg.make_client(&p2); // connected to p2, with the old leader
    let ckp2a_name = ckp2a.name.clone();
    let ckp2b = cfg.make_client(&p2);
    let ckp2b_name = ckp2b.name.clone();

    put(&cfg, &ckp1, "1", "14");
    check(&cfg, &ckp1, "1", "14");

    cfg.end();

    cfg.begin("Test: no progress in minority");

    let (done0_tx, done0_rx) = mpsc::channel();
    {
        let cfg = cfg.clone();
        thread::spawn(move || {
            put(&cfg, &ckp2a, "1", "15");
            done0_tx.send(()).unwrap();
        });
    }
    let (done1_tx, done1_rx) = mpsc::channel();
    {
        let cfg = cfg.clone();
        thread::spawn(move || {
            get(&cfg, &ckp2b, "1"); // different clerk to p2
            done1_tx.send(()).unwrap();
        });
    }

    thread::sleep(Duration::from_secs(1));
    assert!(done0_rx.try_recv().is_err(), "put in minority completed");
    assert!(done1_rx.try_recv().is_err(), "get in minority completed");

    check(&cfg, &ckp1, "1", "14");
    put(&cfg, &ckp1, "1", "16");
    check(&cfg, &ckp1, "1", "16");

    cfg.end();

    cfg.begin("Test: completion after heal");

    cfg.connect_all();
    cfg.connect_client_by_name(&ckp2a_name, &cfg.all());
    cfg.connect_client_by_name(&ckp2b_name, &cfg.all());

    thread::sleep(ELECTION_TIMEOUT);

    done0_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("put did not complete after heal");
    done1_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("get did not complete after heal");

    // the stale leader's put lands after the majority's writes
    check(&cfg, &ck, "1", "15");

    cfg.end();
}

#[test]
fn test_many_clients() {
    generic_test(5, false, false, false);
}

#[test]
fn test_unreliable_one_client() {
    generic_test(1, true, false, false);
}

#[test]
fn test_unreliable_many_clients() {
    generic_test(5, true, false, false);
}

#[test]
fn test_partitions_many_clients() {
    generic_test(5, false, false, true);
}

#[test]
fn test_restarts_one_client() {
    generic_test(1, false, true, false);
}

#[test]
fn test_restarts_many_clients() {
    generic_test(5, false, true, false);
}
