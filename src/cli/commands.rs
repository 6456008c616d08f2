use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ledger-forge", about = "Proof-of-work ledger node")]
pub struct Opt {
    #[arg(
        long,
        global = true,
        help = "TOML configuration file (environment variables still override it)"
    )]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "init", about = "Create the chain store with its genesis block")]
    Init {
        #[arg(long, help = "Discard any existing chain and start again from genesis")]
        reset: bool,
    },
    #[command(name = "send", about = "Submit a transfer and mine it into a block")]
    Send {
        #[arg(help = "Sending account")]
        from: String,
        #[arg(help = "Receiving account")]
        to: String,
        #[arg(help = "Amount in coins, e.g. 10 or 0.5")]
        amount: String,
        #[arg(long, default_value = "0", help = "Fee in coins")]
        fee: String,
        #[arg(
            long,
            value_name = "MINER",
            help = "Mine the transaction right away, paying the reward to MINER"
        )]
        mine: Option<String>,
    },
    #[command(name = "mine", about = "Mine one block on the current tip")]
    Mine {
        #[arg(help = "Account that receives the block reward")]
        miner: String,
        #[arg(long, default_value_t = 600, help = "Give up after this many seconds")]
        timeout: u64,
    },
    #[command(name = "printchain", about = "Print all blocks in the chain")]
    Printchain,
    #[command(name = "block", about = "Print one block as JSON")]
    Block {
        #[arg(help = "Block index")]
        index: u64,
    },
    #[command(name = "validate", about = "Re-check every block from genesis")]
    Validate,
    #[command(name = "prove", about = "Merkle inclusion proof for a committed transaction")]
    Prove {
        #[arg(help = "Transaction id (hex)")]
        txid: String,
    },
    #[command(name = "balance", about = "Net balance of an account")]
    Balance {
        #[arg(help = "Account name or address")]
        account: String,
    },
    #[command(name = "stats", about = "Chain and store statistics")]
    Stats,
    #[command(name = "peers", about = "List known peers")]
    Peers,
    #[command(name = "addpeer", about = "Remember a peer address")]
    Addpeer {
        #[arg(help = "Peer address, host:port")]
        address: String,
    },
    #[command(name = "sync", about = "Adopt a longer valid chain from peers")]
    Sync {
        #[arg(help = "Only this peer; all known peers when omitted")]
        address: Option<String>,
    },
    #[command(name = "serve", about = "Answer peer requests on the node address")]
    Serve,
    #[command(name = "snapshot", about = "Export the chain as JSON, or import one")]
    Snapshot {
        #[arg(long, value_name = "FILE", help = "Adopt the chain in FILE if it is longer")]
        import: Option<PathBuf>,
    },
    #[command(name = "mempool", about = "Show pending transactions")]
    Mempool,
}
