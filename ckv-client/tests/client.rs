use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ckv_client::mock::{MockConnector, NullMarshaller};
use ckv_client::{CacheError, FactoryConfig, RemoteCache, ServerAddress, TopologyId, TransportFactory};
use ckv_common::{JsonMarshaller, StringMarshaller};

type Handler = fn(usize, Vec<Vec<u8>>, &mut TcpStream);

/// Serves one connection per entry of `commands_per_conn`, reading that many
/// commands from each. Commands are numbered across connections.
fn spawn_server(commands_per_conn: &'static [usize], handler: Handler) -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    thread::spawn(move || {
        let mut idx = 0;
        for &commands in commands_per_conn {
            let (mut stream, _) = listener.accept().expect("accept");
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            for _ in 0..commands {
                let args = read_command(&mut reader).expect("read command");
                handler(idx, args, &mut stream);
                idx += 1;
            }
        }
    });

    ServerAddress::from(addr)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        if !data.ends_with(b"\r\n") {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        data.truncate(len);
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"))
}

fn write_reply(stream: &mut TcpStream, reply: &[u8]) {
    let _ = stream.write_all(reply);
    let _ = stream.flush();
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    write_reply(stream, &out);
}

fn tcp_factory(server: ServerAddress) -> Arc<TransportFactory> {
    let factory = Arc::new(TransportFactory::tcp());
    let config = FactoryConfig {
        max_total: 1,
        max_idle: 1,
        read_timeout_ms: 1_000,
        write_timeout_ms: 1_000,
        ..FactoryConfig::default()
    };
    factory.start(config, vec![server], TopologyId::ZERO).expect("start");
    factory
}

fn string_cache(factory: Arc<TransportFactory>) -> RemoteCache<StringMarshaller, StringMarshaller> {
    RemoteCache::new(factory, StringMarshaller, StringMarshaller)
}

#[test]
fn put_get_roundtrip() {
    let server = spawn_server(&[2], |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args, vec![b"SET".to_vec(), b"user:1".to_vec(), b"ana".to_vec()]);
            write_reply(stream, b"+OK\r\n");
        } else {
            assert_eq!(args, vec![b"GET".to_vec(), b"user:1".to_vec()]);
            write_bulk(stream, b"ana");
        }
    });

    let cache = string_cache(tcp_factory(server));
    cache.put(&"user:1".to_string(), &"ana".to_string()).expect("put");
    assert_eq!(cache.get(&"user:1".to_string()).expect("get"), Some("ana".to_string()));
}

#[test]
fn missing_key_and_remove() {
    let server = spawn_server(&[3], |idx, args, stream| match idx {
        0 => {
            assert_eq!(args[0], b"GET");
            write_reply(stream, b"$-1\r\n");
        }
        1 => {
            assert_eq!(args, vec![b"DEL".to_vec(), b"gone".to_vec()]);
            write_reply(stream, b":1\r\n");
        }
        _ => write_reply(stream, b":0\r\n"),
    });

    let cache = string_cache(tcp_factory(server));
    assert_eq!(cache.get(&"gone".to_string()).expect("get"), None);
    assert!(cache.remove(&"gone".to_string()).expect("remove"));
    assert!(!cache.remove(&"gone".to_string()).expect("remove again"));
}

#[test]
fn ping_and_server_error() {
    let server = spawn_server(&[2], |idx, _args, stream| {
        if idx == 0 {
            write_reply(stream, b"+PONG\r\n");
        } else {
            write_reply(stream, b"-ERR busy\r\n");
        }
    });

    let cache = string_cache(tcp_factory(server));
    cache.ping().expect("ping");
    let err = cache.get(&"k".to_string()).unwrap_err();
    assert!(matches!(err, CacheError::Server(msg) if msg.contains("busy")));
}

#[test]
fn dropped_connection_is_retried_on_fresh_transport() {
    // First connection closes without replying; the retry gets a new one.
    let server = spawn_server(&[1, 1], |idx, args, stream| {
        assert_eq!(args[0], b"GET");
        if idx == 1 {
            write_bulk(stream, b"v");
        }
    });

    let factory = tcp_factory(server.clone());
    let cache = string_cache(factory.clone());
    assert_eq!(cache.get(&"k".to_string()).expect("get"), Some("v".to_string()));

    let stats = factory.pool_stats(&server).expect("pool");
    assert_eq!(stats.total, 1);
    assert_eq!(stats.leased, 0);
}

#[test]
fn put_with_ttl_sends_whole_seconds() {
    let connector = MockConnector::new();
    connector.set_script(b"+OK\r\n".to_vec());
    let factory = Arc::new(TransportFactory::with_connector(Arc::new(connector.clone())));
    let server = ServerAddress::new("cache", 11222);
    factory
        .start(FactoryConfig::default(), vec![server.clone()], TopologyId::ZERO)
        .expect("start");

    let cache = RemoteCache::new(factory, StringMarshaller, JsonMarshaller::<Vec<u32>>::new());
    cache
        .put_with_ttl(&"k".to_string(), &vec![1, 2], Duration::from_millis(1_500))
        .expect("put");

    assert_eq!(
        connector.written(&server),
        b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\n[1,2]\r\n$2\r\nEX\r\n$1\r\n2\r\n".to_vec()
    );
}

#[test]
fn unmarshallable_key_never_reaches_a_server() {
    let connector = MockConnector::new();
    let factory = Arc::new(TransportFactory::with_connector(Arc::new(connector.clone())));
    factory
        .start(FactoryConfig::default(), vec![ServerAddress::new("cache", 11222)], TopologyId::ZERO)
        .expect("start");

    let cache = RemoteCache::new(factory, NullMarshaller::<String>::default(), StringMarshaller);
    let err = cache.get(&"k".to_string()).unwrap_err();
    assert!(matches!(err, CacheError::Serialization(_)));
    assert_eq!(connector.total_connects(), 0);
}
