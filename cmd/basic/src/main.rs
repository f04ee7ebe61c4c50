//! Basic Weft example
//!
//! Demonstrates spawning fibers, cooperative yielding, queues and the
//! scheduler stats.

use std::time::Duration;

use weft::prelude::*;

fn main() -> weft::Result<()> {
    env_logger::init();
    println!("=== Weft Basic Example ===\n");

    weft::run_default(|| {
        println!("backend: {:?}\n", weft::kind()?);

        // A few fibers taking turns.
        let mut workers = Vec::new();
        for id in 1..=3 {
            workers.push(weft::spawn(move || {
                for round in 0..3 {
                    println!("[fiber {}] round {}", id, round);
                    weft::snooze()?;
                }
                Ok(id)
            })?);
        }
        for worker in workers {
            let id = worker.join()?;
            println!("[fiber {}] finished", id);
        }

        // Producer/consumer over a queue.
        let queue: Queue<i32> = Queue::new();
        let consumer_queue = queue.clone();
        let consumer = weft::spawn(move || {
            let mut sum = 0;
            loop {
                let value = consumer_queue.shift()?;
                if value < 0 {
                    return Ok(sum);
                }
                sum += value;
            }
        })?;
        let producer_queue = queue.clone();
        let producer = weft::spawn(move || {
            for v in 1..=10 {
                producer_queue.push(v);
                weft::snooze()?;
            }
            producer_queue.push(-1);
            Ok(())
        })?;
        producer.join()?;
        let sum = consumer.join()?;
        println!("\nqueue sum: {}", sum);

        // A timer tick.
        let mut ticks = 0;
        weft::timer_loop(Duration::from_millis(50), || {
            ticks += 1;
            println!("tick {}", ticks);
            Ok(ticks < 3)
        })?;

        let stats = weft::stats()?;
        println!(
            "\nstats: switches={} ops={} polls={}",
            stats.switch_count, stats.op_count, stats.poll_count
        );
        Ok(())
    })
}
