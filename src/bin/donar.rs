use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use getopts::Options;

use donar::dns::context::ServerContext;
use donar::dns::processor::RequestProcessor;
use donar::dns::server::UdpUpdateServer;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the update server
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optmulti(
        "l",
        "listen",
        "Address and port to listen on; may be given multiple times (default 0.0.0.0:21001)",
        "ADDR:PORT",
    );
    opts.optopt(
        "",
        "store-host",
        "Host of the replicated key/value store peer (default localhost)",
        "HOST",
    );
    opts.optopt(
        "",
        "store-port",
        "Port of the replicated key/value store peer (default 2727)",
        "PORT",
    );
    opts.optopt(
        "",
        "suffix-base",
        "Domain base under which fresh accounts publish (default donardns.net)",
        "DOMAIN",
    );
    opts.optopt(
        "",
        "handler-ceiling",
        "Maximum concurrently active packet handlers (default 100)",
        "COUNT",
    );
    opts.optflag(
        "",
        "enforce-sequence",
        "Reject packets whose sequence number does not match the account's",
    );
    opts.optopt(
        "",
        "geoip-db",
        "Path to a MaxMind city database for proximity answers",
        "PATH",
    );
    opts.optopt(
        "",
        "max-records",
        "Address answers returned per query (default 1)",
        "COUNT",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(&program, opts);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let mut context = ServerContext::new();

    let listen = opt_matches.opt_strs("l");
    if !listen.is_empty() {
        let mut addrs = Vec::new();
        for spec in listen {
            match spec.parse::<SocketAddr>() {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    log::error!("Invalid listen address {}: {}", spec, e);
                    std::process::exit(1);
                }
            }
        }
        context.listen_addrs = addrs;
    }

    if let Some(host) = opt_matches.opt_str("store-host") {
        context.store_host = host;
    }
    if let Some(port) = opt_matches.opt_str("store-port") {
        match port.parse() {
            Ok(port) => context.store_port = port,
            Err(e) => {
                log::error!("Invalid store port {}: {}", port, e);
                std::process::exit(1);
            }
        }
    }
    if let Some(base) = opt_matches.opt_str("suffix-base") {
        context.suffix_base = base;
    }
    if let Some(ceiling) = opt_matches.opt_str("handler-ceiling") {
        match ceiling.parse() {
            Ok(ceiling) => context.handler_ceiling = ceiling,
            Err(e) => {
                log::error!("Invalid handler ceiling {}: {}", ceiling, e);
                std::process::exit(1);
            }
        }
    }
    if let Some(max) = opt_matches.opt_str("max-records") {
        match max.parse() {
            Ok(max) => context.max_records = max,
            Err(e) => {
                log::error!("Invalid max records {}: {}", max, e);
                std::process::exit(1);
            }
        }
    }
    context.enforce_sequence = opt_matches.opt_present("enforce-sequence");
    context.geoip_db = opt_matches.opt_str("geoip-db");

    let context = Arc::new(context);

    let backend = match context.create_backend() {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("Failed to connect storage backend: {}", e);
            std::process::exit(1);
        }
    };

    let ownership = match context.create_ownership_validator() {
        Ok(ownership) => ownership,
        Err(e) => {
            log::error!("Failed to set up ownership validation: {}", e);
            std::process::exit(1);
        }
    };

    let processor = RequestProcessor::new(backend, ownership, context.enforce_sequence);
    let server = UdpUpdateServer::new(context.clone(), processor);
    match server.run_server() {
        Ok(addrs) => {
            log::info!("update server started on {:?}", addrs);
        }
        Err(e) => {
            log::error!("Failed to start update server: {}", e);
            std::process::exit(1);
        }
    }

    // The receive loops own the sockets; nothing left for this thread to do
    loop {
        std::thread::park();
    }
}
