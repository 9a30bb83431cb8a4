//! Inspect a timeline database: fragment chains, gaps, and event ranges.
//!
//! Walks each room's fragment graph, prints every chain front to back with
//! its links, tokens, and stored event ranges, and flags anything that
//! violates the graph invariants.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::error::Error;
use std::path::PathBuf;

use clap::Parser;

use weft::logging;
use weft::simulation::check_fragment_invariants;
use weft::storage::{Storage, StoreTxn};
use weft::timeline::{EventKey, Fragment, FragmentIdComparer};

#[derive(Parser)]
#[command(
    name = "weft-inspector",
    about = "Dump the fragment graph of a timeline database"
)]
struct Args {
    /// Path to the timeline database file
    db: PathBuf,

    /// Only inspect this room
    #[arg(long)]
    room: Option<String>,

    /// How many events to list per fragment
    #[arg(long, default_value_t = 3)]
    events: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    logging::init();
    let args = Args::parse();
    let mut storage = Storage::open(&args.db)?;
    let txn = storage.begin()?;

    let rooms = match &args.room {
        Some(room) => vec![room.clone()],
        None => txn.timeline_fragments().rooms()?,
    };
    if rooms.is_empty() {
        println!("no rooms stored");
        return Ok(());
    }

    for room in &rooms {
        println!("room {room}");
        inspect_room(&txn, room, args.events)?;
        match check_fragment_invariants(&txn, room) {
            Ok(()) => println!("  invariants: ok"),
            Err(violation) => println!("  invariants: VIOLATED: {violation}"),
        }
        println!();
    }
    Ok(())
}

fn inspect_room(
    txn: &StoreTxn<'_>,
    room: &str,
    events_per_fragment: u32,
) -> Result<(), Box<dyn Error>> {
    let fragments = txn.timeline_fragments().all(room)?;
    let comparer = FragmentIdComparer::from_fragments(fragments.iter());

    // chains start at fragments with no resolved previous side
    let mut printed = HashSet::new();
    for head in fragments.iter().filter(|f| f.previous_id.is_none()) {
        println!("  chain:");
        let mut current = Some(head.clone());
        let mut prior: Option<i64> = None;
        while let Some(fragment) = current {
            if !printed.insert(fragment.id) {
                println!("    !! fragment {} visited twice, link cycle", fragment.id);
                break;
            }
            print_fragment(txn, room, &fragment, events_per_fragment)?;
            if let Some(prior) = prior {
                if comparer.compare(prior, fragment.id) != Ok(Ordering::Less) {
                    println!(
                        "    !! comparer disagrees with link order for {} -> {}",
                        prior, fragment.id
                    );
                }
            }
            prior = Some(fragment.id);
            current = match fragment.next_id {
                Some(next_id) => txn.timeline_fragments().get(room, next_id)?,
                None => None,
            };
        }
    }
    for fragment in fragments.iter().filter(|f| !printed.contains(&f.id)) {
        println!("  unreachable from any chain head:");
        print_fragment(txn, room, fragment, events_per_fragment)?;
    }
    Ok(())
}

fn print_fragment(
    txn: &StoreTxn<'_>,
    room: &str,
    fragment: &Fragment,
    events_per_fragment: u32,
) -> Result<(), Box<dyn Error>> {
    let count = txn.timeline_events().count(room, fragment.id)?;
    println!(
        "    fragment {} ({count} event{}):",
        fragment.id,
        if count == 1 { "" } else { "s" }
    );
    println!(
        "      previous: {}",
        describe_side(fragment.previous_id, &fragment.previous_token, fragment.edge_reached)
    );
    println!(
        "      next:     {}",
        describe_side(fragment.next_id, &fragment.next_token, fragment.edge_reached)
    );
    let listed = txn.timeline_events().events_after(
        room,
        EventKey::new(fragment.id, i64::MIN),
        events_per_fragment,
    )?;
    for row in &listed {
        println!("      {} {}", row.key, logging::event_id(&row.event_id));
    }
    if count > listed.len() as u64 {
        println!("      … {} more", count - listed.len() as u64);
    }
    Ok(())
}

fn describe_side(link: Option<i64>, token: &Option<String>, edge_reached: bool) -> String {
    match (link, token) {
        (Some(id), None) => format!("linked to fragment {id}"),
        (None, Some(token)) => format!("gap (token {token:?})"),
        (Some(id), Some(token)) => {
            format!("shallow link to fragment {id}, gap unfilled (token {token:?})")
        }
        (None, None) if edge_reached => "edge of history".to_string(),
        (None, None) => "open".to_string(),
    }
}
