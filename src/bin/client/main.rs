use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
    num::NonZeroUsize,
    os::unix::{fs::FileExt, net::UnixStream},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use colored::Colorize;
use gfn_to_pfn::{
    translate::{PAGE_SHIFT, PAGE_SIZE},
    virt_to_phys::{LinuxPageMap, VirtToPhysResolver},
};
use log::debug;
use nix::sys::mman::{self, MapFlags, ProtFlags};

#[derive(Parser, Debug)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a guest physical address to a host physical address
    Query {
        /// guest physical address. Decimal, 0x prefixed hex or 0 prefixed octal
        gpa: String,
        /// pid of the process owning the VM. Defaults to the first registered VM
        pid: Option<String>,
        /// unix socket of the endpoint
        #[arg(long, default_value = "/run/gfn_to_pfn.sock")]
        socket: String,
        /// talk to the endpoint over tcp (ip:port) instead of the unix socket
        #[arg(long)]
        tcp: Option<String>,
    },
    /// Run inside a guest: map a page, write to it and print its guest physical address
    GuestGpa {
        /// byte written into the page
        #[arg(long, default_value_t = 24)]
        value: u8,
        /// offset inside the page at which `value` is written
        #[arg(long, default_value = "0x80", value_parser = maybe_hex::<u64>)]
        offset: u64,
    },
    /// Read one byte of physical memory through /dev/mem
    PhysRead {
        #[arg(value_parser = maybe_hex::<u64>)]
        addr: u64,
    },
}

/// Send `query` and return the reply line
fn exchange<S: Read + Write>(mut stream: S, query: &str) -> Result<String> {
    stream
        .write_all(query.as_bytes())
        .context("failed to send query")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("failed to receive reply")?;
    if reply.is_empty() {
        bail!("endpoint closed the connection without replying");
    }
    Ok(reply)
}

fn query(gpa: &str, pid: Option<&str>, socket: &str, tcp: Option<&str>) -> Result<()> {
    let query = match pid {
        Some(pid) => format!("{} {}\n", gpa, pid),
        None => format!("{}\n", gpa),
    };
    debug!("sending query {:?}", query);

    let reply = match tcp {
        Some(addr) => exchange(
            TcpStream::connect(addr).context(format!("failed to connect to {}", addr))?,
            &query,
        )?,
        None => exchange(
            UnixStream::connect(socket).context(format!("failed to connect to {}", socket))?,
            &query,
        )?,
    };

    let reply = reply.trim_end();
    if reply.starts_with("ok") {
        println!("Endpoint reply: {}", reply.green());
    } else {
        println!("Endpoint reply: {}", reply.red());
    }
    Ok(())
}

fn guest_gpa(value: u8, offset: u64) -> Result<()> {
    if offset >= PAGE_SIZE {
        bail!("offset 0x{:x} is outside of the page", offset);
    }

    let page_bytes = NonZeroUsize::new(PAGE_SIZE as usize).context("page size is zero")?;
    let buffer = unsafe {
        mman::mmap(
            None,
            page_bytes,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_ANON | MapFlags::MAP_PRIVATE,
            -1,
            0,
        )
        .context("failed to mmap page")?
    };

    //writing also makes sure the page gets backed by a frame
    let write_addr = unsafe {
        let ptr = (buffer as *mut u8).add(offset as usize);
        ptr.write_volatile(value);
        ptr as u64
    };

    let result = LinuxPageMap::new()
        .and_then(|mut pagemap| pagemap.get_phys(write_addr))
        .context(format!("failed to translate 0x{:x} to gpa", write_addr));

    if let Ok(gpa) = &result {
        println!("Virtual address: 0x{:x}", write_addr);
        println!("Base guest frame: 0x{:x}", gpa >> PAGE_SHIFT);
        println!("Full guest address: 0x{:x}", gpa);
        println!("client query 0x{:x}", gpa);

        println!("\nPress Enter to exit...");
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .context("failed to read from stdin")?;
    }

    let unmapped = unsafe { mman::munmap(buffer, PAGE_SIZE as usize) };
    unmapped.context("failed to munmap page")?;
    result.map(|_| ())
}

fn phys_read(addr: u64) -> Result<()> {
    let mem = File::open("/dev/mem").context("failed to open /dev/mem")?;
    let mut value = [0u8; 1];
    mem.read_exact_at(&mut value, addr)
        .context(format!("failed to read physical address 0x{:x}", addr))?;
    println!("{}", value[0]);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = CliArgs::parse();
    match args.command {
        Command::Query {
            gpa,
            pid,
            socket,
            tcp,
        } => query(&gpa, pid.as_deref(), &socket, tcp.as_deref()),
        Command::GuestGpa { value, offset } => guest_gpa(value, offset),
        Command::PhysRead { addr } => phys_read(addr),
    }
}
