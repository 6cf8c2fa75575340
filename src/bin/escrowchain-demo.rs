#![forbid(unsafe_code)]
use clap::{Parser, Subcommand};
use colored::*;
use escrowchain::config::load_config;
use escrowchain::crypto::KeyPair;
use escrowchain::escrow::AgreementRequest;
use escrowchain::{logging, MiningOutcome, Node};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Instant;

const MAX_FUNDING_BLOCKS: u32 = 8;

#[derive(Parser)]
#[command(author, version, about = "Scripted local session against an in-memory EscrowChain node", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when it does not exist
    #[arg(long, default_value = "escrowchain.toml")]
    config: PathBuf,
    /// Overrides the configured mining difficulty (0-4)
    #[arg(long)]
    difficulty: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sends a payment between two fresh wallets and mines it
    Transfer {
        #[arg(long, default_value = "5")]
        amount: Decimal,
        #[arg(long, default_value = "0.1")]
        fee: Decimal,
    },
    /// Runs an escrow agreement through to delivery, or to a dispute
    Escrow {
        #[arg(long, default_value = "20")]
        amount: Decimal,
        /// Open a dispute after shipment instead of confirming delivery
        #[arg(long)]
        dispute: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(difficulty) = cli.difficulty {
        config.chain.difficulty = difficulty;
    }
    logging::init(&config.logging)?;

    let node = Node::new(config)?;
    println!("{}", "EscrowChain demo".bright_cyan().bold());
    println!("{}", "----------------".bright_cyan());
    println!("Difficulty: {}", node.difficulty().to_string().bright_white());

    match cli.command {
        Commands::Transfer { amount, fee } => transfer(&node, amount, fee)?,
        Commands::Escrow { amount, dispute } => escrow(&node, amount, dispute)?,
    }

    let valid = node.validate_chain();
    println!();
    println!(
        "Chain length {}, valid: {}",
        node.chain_len(),
        if valid { "yes".green() } else { "no".red() }
    );
    Ok(())
}

fn mine_pending(node: &Node, miner: &str) -> Result<(), Box<dyn std::error::Error>> {
    let indices: Vec<usize> = (0..node.pending_transactions().len()).collect();
    println!("{}", format!("⛏️  Mining {} pending transaction(s)...", indices.len()).yellow());

    let start = Instant::now();
    match node.mine(miner, &indices)? {
        MiningOutcome::Mined(block) => {
            println!(
                "{} block {} nonce {} in {:.2?}",
                "✅".green(),
                block.index.to_string().bright_white(),
                block.nonce,
                start.elapsed()
            );
            println!("   hash   {}", block.hash.dimmed());
            println!("   reward {}", block.transactions[0].amount.to_string().bright_green());
        }
        MiningOutcome::Stopped => println!("{}", "Mining stopped".red()),
    }
    Ok(())
}

fn print_balance(node: &Node, label: &str, address: &str) {
    println!("   {:<9} {}", label, node.balance(address).to_string().bright_white());
}

fn transfer(node: &Node, amount: Decimal, fee: Decimal) -> Result<(), Box<dyn std::error::Error>> {
    let alice = node.create_wallet()?;
    let bob = node.create_wallet()?;
    let miner = KeyPair::generate().address();

    println!();
    println!("{}", "Sending payment".bright_green().underline());
    node.send(&alice.address(), &bob.address(), amount, fee, &alice.secret_key_hex())?;
    println!(
        "   alice available after admission: {}",
        node.available_balance(&alice.address()).to_string().bright_white()
    );

    mine_pending(node, &miner)?;
    print_balance(node, "alice", &alice.address());
    print_balance(node, "bob", &bob.address());
    print_balance(node, "miner", &miner);
    Ok(())
}

fn escrow(node: &Node, amount: Decimal, dispute: bool) -> Result<(), Box<dyn std::error::Error>> {
    let buyer = node.create_wallet()?;
    let seller = node.create_wallet()?;
    let miner = KeyPair::generate().address();

    // fund the buyer with a few blocks of mining rewards
    let mut funding_blocks = 0;
    while node.balance(&buyer.address()) < amount * Decimal::new(102, 2) {
        if funding_blocks == MAX_FUNDING_BLOCKS {
            return Err(format!("buyer cannot be funded for an agreement of {}", amount).into());
        }
        mine_pending(node, &buyer.address())?;
        funding_blocks += 1;
    }

    let agreement_id = format!("demo-{}", node.chain_len());
    println!();
    println!("{}", format!("Escrow agreement {}", agreement_id).bright_green().underline());

    node.create_agreement(
        AgreementRequest {
            agreement_id: agreement_id.clone(),
            buyer: buyer.address(),
            seller: seller.address(),
            amount,
            description: "demo purchase".to_string(),
        },
        &buyer.secret_key_hex(),
    )?;
    mine_pending(node, &miner)?;
    println!("   locked {}", node.locked_funds(&agreement_id).to_string().bright_white());

    node.confirm_seller_participation(&agreement_id, &seller.address())?;
    node.confirm_shipment(&agreement_id, &seller.address(), Some("TRACK-0001".to_string()))?;

    if dispute {
        node.open_dispute(&agreement_id, &buyer.address(), Some("item not as described".to_string()))?;
    } else {
        node.confirm_delivery(&agreement_id, &buyer.address())?;
    }
    mine_pending(node, &miner)?;

    if let Some(agreement) = node.agreement(&agreement_id) {
        println!("   status {}", agreement.status.to_string().bright_cyan());
    }
    print_balance(node, "buyer", &buyer.address());
    print_balance(node, "seller", &seller.address());
    print_balance(node, "mediator", node.config().escrow.mediator_address.as_str());
    Ok(())
}
