fn main() -> anyhow::Result<()> {
    ballot_events_lib::run()
}
