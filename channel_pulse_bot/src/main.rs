use pulse_bot_commons::*;

fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "warn,channel_pulse_bot=debug");
    }
    start_everything(channel_pulse_bot::entry());
}
