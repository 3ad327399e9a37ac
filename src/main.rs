fn main() {
    streamquant::main();
}
